//! WebSocket Connection Handler
//!
//! Each connection runs a sender task (frames plus heartbeat) and a receiver task;
//! whichever finishes first tears the connection down.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::protocol::{ClientText, HeartbeatMode, StatusFrame};
use super::state::AppState;

/// Handle a WebSocket connection
pub async fn handle_websocket(socket: WebSocket, state: AppState, filter: Option<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Create channel for sending frames to this client
    let (tx, mut rx) = mpsc::channel::<StatusFrame>(64);

    let session_id = state.register_client(filter.as_deref(), tx);

    // Initial snapshot
    let snapshot = StatusFrame::snapshot(state.snapshot());
    if let Ok(json) = serde_json::to_string(&snapshot) {
        if ws_sender.send(Message::Text(json)).await.is_err() {
            state.remove_client(session_id);
            return;
        }
    }

    let heartbeat = state.heartbeat();
    let last_seen = Arc::new(Mutex::new(Instant::now()));

    let sender_seen = last_seen.clone();
    let mut send_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(json) = serde_json::to_string(&frame) else { continue };
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if sender_seen.lock().elapsed() > heartbeat.timeout {
                        tracing::info!(%session_id, "Heartbeat timed out; closing socket");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    let ping = match heartbeat.mode {
                        HeartbeatMode::Protocol => Message::Ping(Vec::new()),
                        HeartbeatMode::Text => Message::Text("ping".to_string()),
                    };
                    if ws_sender.send(ping).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            *last_seen.lock() = Instant::now();
            match msg {
                Message::Text(text) => match ClientText::parse(&text) {
                    ClientText::Close => break,
                    ClientText::Pong => {}
                    ClientText::Other => {
                        tracing::trace!(%session_id, "Ignoring client text: {}", text);
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to complete, then cancel the other
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.remove_client(session_id);
}
