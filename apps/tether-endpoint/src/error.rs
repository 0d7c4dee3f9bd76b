use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("relay sent no auth frame within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("relay rejected the handshake: {0}")]
    HandshakeRejected(String),
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("relay closed the connection")]
    Closed,
    #[error("screen capture failed: {0}")]
    Capture(String),
    #[error("input injection failed: {0}")]
    Input(String),
}
