use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_SIGNALING_PORT: u16 = 3000;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNECTIONS: usize = 255;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Relay settings
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub bind_addr: String,
    /// Interval between protocol-level pings
    pub heartbeat_interval: Duration,
    /// When set, a connection that leaves a ping unanswered for this long is
    /// dropped. `None` keeps pings advisory.
    pub pong_timeout: Option<Duration>,
    pub max_connections: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_SIGNALING_PORT),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            pong_timeout: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl SignalingConfig {
    /// Defaults overridden by `PORT`, `HEARTBEAT_INTERVAL_MS`,
    /// `PONG_TIMEOUT_MS` and `MAX_CONNECTIONS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = parse::<u16>(&lookup, "PORT")? {
            config.bind_addr = format!("0.0.0.0:{}", port);
        }
        if let Some(ms) = parse::<u64>(&lookup, "HEARTBEAT_INTERVAL_MS")? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: "HEARTBEAT_INTERVAL_MS",
                    value: ms.to_string(),
                });
            }
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "PONG_TIMEOUT_MS")? {
            config.pong_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(max) = parse::<usize>(&lookup, "MAX_CONNECTIONS")? {
            config.max_connections = max;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Client-side settings handed to the RTC layer
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ice_servers: Vec<IceServer>,
    /// `PeerEvent`s buffered for the media layer; beyond this they are dropped
    pub event_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_SERVER.to_string()],
                username: None,
                credential: None,
            }],
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}
