//! Primitives shared by the Tether relay and the controlled endpoint agent.

pub mod protocol;
pub mod shutdown;
pub mod token;

pub use protocol::{
    decode_controller_command, decode_endpoint_frame, ControllerCommand, EndpointFrame,
    FrameError, RelayMessage,
};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use token::{Token, TokenClaims, TokenError, TokenIssuer, TokenScope};

/// Identifier assigned to a registered peer connection.
pub type SessionId = String;

/// Generate a new session identifier.
pub fn generate_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}
