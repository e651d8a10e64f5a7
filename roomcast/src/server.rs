use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use roomcast_sfu::{RegistryStats, SignalingHandler};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::websocket;

/// Shared state of every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<SignalingHandler>,
    pub server: Arc<ServerConfig>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    stats: RegistryStats,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        stats: state.handler.registry().get_stats(),
    })
}

/// Build the HTTP router: `/ws` signaling plus `/healthz`
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/healthz", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use roomcast_sfu::{EngineConfig, LoopbackEngine, NotificationFanout, PeerId, RoomId, RoomRegistry, SfuConfig};
    use tower::ServiceExt;

    fn state() -> AppState {
        let registry = Arc::new(RoomRegistry::new(Arc::new(SfuConfig::default())));
        let fanout = Arc::new(NotificationFanout::new(Arc::clone(&registry)));
        let handler = SignalingHandler::new(
            Arc::new(LoopbackEngine::new(EngineConfig::default())),
            registry,
            fanout,
            EngineConfig::default(),
        );
        AppState {
            handler: Arc::new(handler),
            server: Arc::new(ServerConfig::default()),
        }
    }

    #[tokio::test]
    async fn test_healthz_reports_counts() {
        let state = state();
        let (session, _events) = state.handler.connect(PeerId::from("a"));
        state.handler.join_room(&session, RoomId::from("r1")).unwrap();

        let response = build_router(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["activeRooms"], 1);
        assert_eq!(body["joinedPeers"], 1);
        assert_eq!(body["connectedPeers"], 1);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let response = build_router(state())
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
