//! Status Monitor Protocol
//!
//! Frames pushed to websocket subscribers and the small text vocabulary clients may
//! send back.

use std::time::Duration;

use serde::Serialize;

use sdk_core::{ComponentRecord, Snapshot};

/// Frame sent to a websocket subscriber.
///
/// Serialized without a wrapper: the snapshot is the registry object itself and a
/// change is the bare record, so existing clients keyed on `id` keep working.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatusFrame {
    /// Full registry, sent once on connect
    Snapshot(Snapshot),
    /// One changed record
    Change(ComponentRecord),
}

impl StatusFrame {
    pub fn snapshot(snapshot: Snapshot) -> Self {
        StatusFrame::Snapshot(snapshot)
    }

    pub fn change(record: ComponentRecord) -> Self {
        StatusFrame::Change(record)
    }

    /// Component id for change frames
    pub fn component_id(&self) -> Option<&str> {
        match self {
            StatusFrame::Snapshot(_) => None,
            StatusFrame::Change(record) => Some(&record.id),
        }
    }
}

/// Text messages understood from clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientText {
    Pong,
    Close,
    Other,
}

impl ClientText {
    pub fn parse(text: &str) -> Self {
        match text.trim().trim_matches('"') {
            "pong" => ClientText::Pong,
            "close" => ClientText::Close,
            _ => ClientText::Other,
        }
    }
}

/// How liveness pings are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatMode {
    /// Websocket protocol Ping frames; clients answer with Pong frames
    #[default]
    Protocol,
    /// Text `"ping"` messages; clients answer with text `"pong"`
    Text,
}

/// Heartbeat timing
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub mode: HeartbeatMode,
    /// Time between pings
    pub interval: Duration,
    /// Close the socket when nothing arrives for this long
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            mode: HeartbeatMode::Protocol,
            interval: Duration::from_millis(200),
            timeout: Duration::from_secs(2),
        }
    }
}

impl HeartbeatConfig {
    pub fn with_mode(mut self, mode: HeartbeatMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
