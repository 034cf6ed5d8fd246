//! Device WebSocket infrastructure.
//!
//! - [`handler`]: the `/websocket` upgrade endpoint.
//! - [`session`]: the per-connection state machine and read loop.
//! - [`manager`]: live session tracking used to drain on shutdown.

pub mod handler;
pub mod manager;
pub mod session;

pub use handler::ws_handler;
pub use manager::SessionManager;
pub use session::{CloseReason, Session, SessionServices, SessionState};
