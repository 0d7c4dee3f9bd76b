//! Frames the endpoint exchanges with the relay.

use serde::{Deserialize, Serialize};
use tether_core::protocol::LEGACY_PONG;

/// Everything the relay may deliver to an endpoint: its own control frames
/// plus the console commands it forwards verbatim.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Auth {
        token: String,
    },
    Pong,
    MouseMove {
        x: f64,
        y: f64,
    },
    MouseClick {
        x: f64,
        y: f64,
    },
    KeyPress {
        key: String,
    },
    Config {
        screen_quality: Option<f64>,
        screen_scale: Option<f64>,
        update_interval: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame<'a> {
    Ping,
    Screen { data: &'a str },
}

impl OutboundFrame<'_> {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn decode_inbound(text: &str) -> Result<InboundFrame, serde_json::Error> {
    if text.trim() == LEGACY_PONG {
        return Ok(InboundFrame::Pong);
    }
    serde_json::from_str(text)
}

/// Clamp a normalised screen coordinate into 0..=1.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
