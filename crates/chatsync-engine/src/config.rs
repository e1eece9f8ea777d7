use std::str::FromStr;
use std::time::Duration;

use chatsync_channel::{ReconnectConfig, WsConfig};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings for the engine and its transports.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Base URL of the chat HTTP API (history, health).
    pub api_base_url: String,
    /// WebSocket gateway endpoint.
    pub gateway_url: String,
    /// Quiet period after the last keystroke before `typing(active=false)`.
    pub typing_idle: Duration,
    /// How long a pending message waits for its ack or echo.
    pub send_timeout: Duration,
    /// Timeout for history and health requests.
    pub request_timeout: Duration,
    pub heartbeat: Duration,
    pub reconnect_attempts: u32,
}

const TYPING_IDLE_MS: u64 = 1000;
const SEND_TIMEOUT_MS: u64 = 5000;
const REQUEST_TIMEOUT_MS: u64 = 10_000;
const HEARTBEAT_SECS: u64 = 15;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            gateway_url: gateway_url_for(DEFAULT_API_BASE_URL),
            typing_idle: Duration::from_millis(TYPING_IDLE_MS),
            send_timeout: Duration::from_millis(SEND_TIMEOUT_MS),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
            heartbeat: Duration::from_secs(HEARTBEAT_SECS),
            reconnect_attempts: 5,
        }
    }
}

impl EngineConfig {
    /// Read `CHATSYNC_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from any variable source. Unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let api_base_url = lookup("CHATSYNC_API_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base_url);
        let gateway_url =
            lookup("CHATSYNC_GATEWAY_URL").unwrap_or_else(|| gateway_url_for(&api_base_url));

        Ok(Self {
            typing_idle: millis(&lookup, "CHATSYNC_TYPING_IDLE_MS", TYPING_IDLE_MS)?,
            send_timeout: millis(&lookup, "CHATSYNC_SEND_TIMEOUT_MS", SEND_TIMEOUT_MS)?,
            request_timeout: millis(&lookup, "CHATSYNC_REQUEST_TIMEOUT_MS", REQUEST_TIMEOUT_MS)?,
            heartbeat: Duration::from_secs(parsed(&lookup, "CHATSYNC_HEARTBEAT_SECS", HEARTBEAT_SECS)?),
            reconnect_attempts: parsed(
                &lookup,
                "CHATSYNC_RECONNECT_ATTEMPTS",
                defaults.reconnect_attempts,
            )?,
            api_base_url,
            gateway_url,
        })
    }

    /// Settings for a [`chatsync_channel::WsChannel`] built from this config.
    pub fn ws_config(&self) -> WsConfig {
        let mut ws = WsConfig::new(self.gateway_url.clone());
        ws.heartbeat = self.heartbeat;
        ws.reconnect = ReconnectConfig {
            max_attempts: self.reconnect_attempts,
            ..ReconnectConfig::default()
        };
        ws
    }
}

/// `http://host` -> `ws://host/gateway`, `https://host` -> `wss://host/gateway`.
pub fn gateway_url_for(api_base_url: &str) -> String {
    let base = api_base_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/gateway", ws)
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        },
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    parsed(lookup, var, default_ms).map(Duration::from_millis)
}
