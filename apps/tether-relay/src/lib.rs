//! Rendezvous relay between controlled endpoints and operator consoles.
//!
//! Endpoints connect on `/ws/client`, consoles on `/ws/control` with a
//! controller-scoped bearer token. Endpoint frames fan out to every console;
//! console commands are routed to the endpoint named by their `client_id`.

pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod websocket;

pub use config::{HeartbeatConfig, RateLimitConfig, RelayConfig};
pub use error::RelayError;
pub use heartbeat::HeartbeatMonitor;
pub use rate_limit::RateLimiter;
pub use registry::{BroadcastReport, CloseReason, ConnectionRegistry, Delivery, Role, Session};
pub use server::{router, AppState, RelayServer, SharedState};
