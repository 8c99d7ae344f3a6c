//! Relay configuration loading.
//!
//! A single YAML file is the sole config source; every key has a default so
//! the relay boots with no file at all. `main` applies the two command-line
//! overrides (relay listen address and store address) after loading.

use serde::Deserialize;
use std::path::Path;

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay_config: RelayConfig,
    pub wsserver_config: WsConfig,
    pub redis_config: RedisConfig,
    pub metric_config: MetricConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay HTTP listen address. A bare `:port` binds all interfaces.
    pub listen: String,
    /// Seconds to keep the process alive after a shutdown signal.
    pub graceful_shutdown_wait_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen: ":8080".to_owned(),
            graceful_shutdown_wait_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    /// WebSocket-level ping period, in seconds.
    pub heartbeat_interval: u64,
    /// Pending-session sweep period, in seconds.
    pub check_session_expire_interval: u64,
    /// How long an unanswered session request stays pending, in seconds.
    pub pending_session_cache_time: u64,
    /// TTL of the per-topic offline message cache, in seconds.
    pub message_cache_time: u64,
    /// WebSocket origin whitelist; `["*"]` allows every origin.
    pub allowed_origins: Vec<String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        WsConfig {
            heartbeat_interval: 10,
            check_session_expire_interval: 10,
            pending_session_cache_time: 1800,
            message_cache_time: 1800,
            allowed_origins: vec!["*".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub server_addr: String,
    pub password: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            server_addr: "127.0.0.1:6379".to_owned(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub enable: bool,
    pub listen: String,
}

impl Default for MetricConfig {
    fn default() -> Self {
        MetricConfig {
            enable: true,
            listen: ":6060".to_owned(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Load the config file at `path`, or the built-in defaults when no path is
/// given. Keys absent from the file keep their defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let cfg = config::Config::builder()
        .add_source(
            config::File::from(path.to_path_buf())
                .format(config::FileFormat::Yaml)
                .required(true),
        )
        .build()?
        .try_deserialize::<Config>()?;
    Ok(cfg)
}

/// Expand a bare `:port` listen address into one `TcpListener::bind`
/// accepts.
pub fn normalize_listen_addr(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_owned()
    }
}
