//! WebSocket Server
//!
//! Serves the registry over HTTP and pushes record changes to websocket clients.

mod handler;
mod protocol;
mod router;
mod state;

pub use handler::*;
pub use protocol::*;
pub use router::*;
pub use state::*;
