//! Controlled-endpoint agent for the Tether relay.
//!
//! [`ReconnectController`] keeps a [`WsSessionDriver`] connected: each session
//! authenticates, streams frames from a [`ScreenSource`], heartbeats, and
//! hands console commands to an [`InputInjector`].

pub mod backoff;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod frames;
pub mod input;
pub mod reconnect;
pub mod session;

pub use backoff::Backoff;
pub use capture::{CaptureSettings, FileFrameSource, ScreenSource};
pub use config::{normalize_relay_url, BackoffConfig, EndpointConfig};
pub use error::EndpointError;
pub use input::{InputInjector, TracingInjector};
pub use reconnect::{ReconnectController, SessionDriver, SessionReport};
pub use session::WsSessionDriver;
