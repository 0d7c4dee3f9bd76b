//! Wire frames exchanged between the relay and its peers.
//!
//! Payload fields owned by collaborators (image bytes, key codes) are never
//! interpreted here: data frames are relayed as the exact text received.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Bare-text heartbeat understood for compatibility with older endpoints.
pub const LEGACY_PING: &str = "ping";
pub const LEGACY_PONG: &str = "pong";

/// Messages originated by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Identity token handed to a newly registered endpoint.
    Auth { token: String },
    Pong,
    ClientConnected { client_id: String },
    ClientDisconnected { client_id: String },
    /// An endpoint frame relayed verbatim to controllers.
    ClientData { client_id: String, data: String },
}

impl RelayMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    NotJson(String),
    #[error("frame is not a json object")]
    NotObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("command has no string `client_id` field")]
    MissingTarget,
    #[error("binary frame is not utf-8 text")]
    Binary,
}

/// A decoded frame sent by a controlled endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointFrame {
    /// Liveness probe; `legacy` when it arrived as the bare text `ping`.
    Ping { legacy: bool },
    /// Reply to a relay keepalive; carries no data.
    Pong,
    /// Any other tagged frame, kept as the raw text for verbatim relay.
    Data { kind: String, raw: String },
}

pub fn decode_endpoint_frame(text: &str) -> Result<EndpointFrame, FrameError> {
    let trimmed = text.trim();
    if trimmed == LEGACY_PING {
        return Ok(EndpointFrame::Ping { legacy: true });
    }
    if trimmed == LEGACY_PONG {
        return Ok(EndpointFrame::Pong);
    }

    let object = parse_object(text)?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?;

    Ok(match kind {
        "ping" => EndpointFrame::Ping { legacy: false },
        "pong" => EndpointFrame::Pong,
        other => EndpointFrame::Data {
            kind: other.to_string(),
            raw: text.to_string(),
        },
    })
}

/// A decoded frame sent by a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Heartbeat from the console itself (a `ping` with no target).
    Ping,
    /// Command addressed to `target`; `raw` is forwarded unchanged.
    Forward { target: String, raw: String },
}

pub fn decode_controller_command(text: &str) -> Result<ControllerCommand, FrameError> {
    let object = parse_object(text)?;
    match object.get("client_id").and_then(Value::as_str) {
        Some(target) if !target.is_empty() => Ok(ControllerCommand::Forward {
            target: target.to_string(),
            raw: text.to_string(),
        }),
        _ if object.get("type").and_then(Value::as_str) == Some("ping") => {
            Ok(ControllerCommand::Ping)
        }
        _ => Err(FrameError::MissingTarget),
    }
}

/// Interpret a binary frame as UTF-8 text.
pub fn binary_as_text(bytes: &[u8]) -> Result<&str, FrameError> {
    std::str::from_utf8(bytes).map_err(|_| FrameError::Binary)
}

fn parse_object(text: &str) -> Result<Map<String, Value>, FrameError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(FrameError::NotObject),
        Err(err) => Err(FrameError::NotJson(err.to_string())),
    }
}
