use std::{path::PathBuf, time::Duration};

use crate::capture::CaptureSettings;

pub const DEFAULT_RELAY_URL: &str = "http://localhost:8000";
const CLIENT_PATH: &str = "/ws/client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub floor: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Normalised WebSocket URL of the relay's endpoint route.
    pub relay_url: String,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    pub backoff: BackoffConfig,
    pub capture: CaptureSettings,
    pub frame_file: Option<PathBuf>,
    /// How long a running session may take to close once shutdown fires.
    pub shutdown_grace: Duration,
}

impl EndpointConfig {
    pub fn new(relay_url: &str) -> Self {
        Self {
            relay_url: normalize_relay_url(relay_url),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            capture: CaptureSettings::default(),
            frame_file: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Turn a user supplied relay address into the endpoint WebSocket URL.
///
/// `http://` maps to `ws://`, `https://` to `wss://`, and a bare host gets
/// `ws://`. The `/ws/client` route is appended unless already present.
pub fn normalize_relay_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        ("ws", rest)
    } else if let Some(rest) = trimmed.strip_prefix("wss://") {
        ("wss", rest)
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        ("ws", rest)
    } else {
        ("ws", trimmed)
    };

    if rest.ends_with(CLIENT_PATH) {
        format!("{scheme}://{rest}")
    } else {
        format!("{scheme}://{rest}{CLIENT_PATH}")
    }
}
