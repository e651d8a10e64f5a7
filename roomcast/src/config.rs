use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use roomcast_sfu::{EngineConfig, SfuConfig};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

use crate::logging::parse_log_level;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted signaling frame in bytes
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before it is considered stuck
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            max_message_size: 64 * 1024,
            outbound_queue: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with(config_file, Self::environment())
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// `ROOMCAST_SERVER__PORT=4100`, `ROOMCAST_SFU__ROOMS_ENABLED=false`, ...
    fn environment() -> Environment {
        Environment::with_prefix("ROOMCAST")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with(config_file: Option<&str>, environment: Environment) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(environment);

        builder.build()?.try_deserialize()
    }

    /// Check cross-field constraints. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must not be 0".to_string());
        }
        if self.server.max_message_size == 0 {
            errors.push("server.max_message_size must be greater than 0".to_string());
        }
        if self.server.outbound_queue == 0 {
            errors.push("server.outbound_queue must be greater than 0".to_string());
        }

        if let Err(e) = parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if self.engine.listen_ip.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "engine.listen_ip is not an IP address: {}",
                self.engine.listen_ip
            ));
        }
        if self.engine.announced_ip.as_deref().is_some_and(str::is_empty) {
            errors.push("engine.announced_ip must not be empty when set".to_string());
        }
        if self.engine.rtc_min_port == 0 {
            errors.push("engine.rtc_min_port must not be 0".to_string());
        }
        if self.engine.port_count() == 0 {
            errors.push(format!(
                "engine.rtc_min_port ({}) is greater than engine.rtc_max_port ({})",
                self.engine.rtc_min_port, self.engine.rtc_max_port
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
