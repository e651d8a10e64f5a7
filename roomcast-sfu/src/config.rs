//! SFU Configuration

use serde::{Deserialize, Serialize};

/// Signaling core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Scope peers into rooms. When disabled every broadcast is global.
    pub rooms_enabled: bool,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            rooms_enabled: true,
            max_rooms: 0,
            max_peers_per_room: 50,
        }
    }
}

/// Options forwarded to the engine when allocating a transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local address the engine binds transports to
    pub listen_ip: String,
    /// Public address advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<String>,
    /// Lowest RTC port handed out to transports
    pub rtc_min_port: u16,
    /// Highest RTC port handed out to transports
    pub rtc_max_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            rtc_min_port: 10000,
            rtc_max_port: 10100,
        }
    }
}

impl EngineConfig {
    /// Address placed into ICE candidates
    #[must_use]
    pub fn candidate_ip(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.listen_ip)
    }

    /// Number of ports in the configured range (0 if the range is inverted)
    #[must_use]
    pub fn port_count(&self) -> u32 {
        if self.rtc_max_port < self.rtc_min_port {
            0
        } else {
            u32::from(self.rtc_max_port - self.rtc_min_port) + 1
        }
    }
}
