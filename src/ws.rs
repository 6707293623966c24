//! WebSocket endpoints for live deployment updates.
//!
//! `/ws` streams every relay message; `/ws/deployments/{id}` streams only
//! one deployment's topic. Both share a select loop that forwards broadcast
//! messages and keeps the connection alive with ping/pong.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::api::SharedState;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let rx = state.relay.subscribe_all();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

pub async fn ws_deployment_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(deployment_id): Path<i64>,
) -> impl IntoResponse {
    let rx = state.relay.subscribe(deployment_id);
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<String>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message receiving, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    // No pong received in time
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Broadcast forwarding ────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // At-most-once delivery: the skipped messages are gone
                        tracing::debug!(skipped, "websocket subscriber lagged");
                        continue;
                    }
                }
            }

            // ── Client messages (pong, close, etc.) ─────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore other messages from client (Text, Binary, Ping)
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeploymentMetrics, DeploymentStatus};
    use crate::relay::{RelayMessage, StatusRelay};

    fn zero_metrics(deployment_id: i64) -> DeploymentMetrics {
        DeploymentMetrics {
            deployment_id,
            error_rate: 0.0,
            success_rate: 0.0,
            active_users: 0,
            total_requests: 0,
            average_response_time: 0.0,
            requests_per_minute: 0.0,
            average_tokens_used: 0.0,
            cost_per_request: 0.0,
            total_cost: 0.0,
            updated_at: "2024-01-01 00:00:00".to_string(),
        }
    }

    #[test]
    fn test_keepalive_constants() {
        // PONG_TIMEOUT must exceed PING_INTERVAL so a fresh connection is
        // never considered dead before its first pong can arrive.
        assert!(PONG_TIMEOUT > PING_INTERVAL);
    }

    #[tokio::test]
    async fn test_topic_subscription_feeds_socket_queue() {
        // The handler wires one relay receiver per socket; a publish after
        // subscribing is what the select loop would forward.
        let relay = StatusRelay::new();
        let mut rx = relay.subscribe(1);
        relay.publish(&RelayMessage::StatusChanged {
            deployment_id: 1,
            status: DeploymentStatus::Active,
            metrics: zero_metrics(1),
        });
        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("\"status\":\"active\""));
    }
}
