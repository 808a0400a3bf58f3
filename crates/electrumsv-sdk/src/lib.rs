//! ElectrumSV SDK
//!
//! Orchestrates the local development stack:
//! - Plugin discovery across builtin, user and project-local tiers
//! - The verb grammar (`install`, `start`, `stop`, `reset`, `node`, `status`, `config`)
//! - Id, datadir and port allocation
//! - Supervised launches in inline, background and new-terminal modes

// Shared engine state
pub mod app_state;

// Command line grammar and parsing
pub mod cli;

// Verb execution
pub mod controller;

// Error taxonomy
pub mod error;

// Component plugins
pub mod plugin;

// Id, datadir and port allocation
pub mod allocator;

// Process launch, supervision and teardown
pub mod supervisor;

// Node JSON-RPC client
pub mod node_rpc;

// Process and filesystem helpers
pub mod util;

pub use app_state::AppState;
pub use controller::Controller;
pub use error::{SdkError, SdkResult};
