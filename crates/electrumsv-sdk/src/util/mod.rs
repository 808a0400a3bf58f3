//! Process and filesystem helpers shared by the supervisor and plugins

pub mod port;
pub mod quote;
pub mod tail;

pub use port::{NetstatProbe, PortProbe};
pub use tail::LogTail;
