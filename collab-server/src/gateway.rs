//! Sync gateway: one task per collaboration WebSocket.
//!
//! ```text
//! socket ──► Document::receive ──► reply to sender (step-2, awareness query)
//!                  │
//!                  └──► BroadcastGroup ──► every other socket on the document
//! ```
//!
//! The task ends when the client closes, the transport fails, or the
//! server shuts down (close 1001). It always detaches from the registry.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};

use crate::error::close_code;
use crate::registry::DocumentRegistry;

/// Per-connection timing.
#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    pub ping_interval: Duration,
    pub awareness_timeout: Duration,
}

type Sink = SplitSink<WebSocket, Message>;

async fn send_binary(sink: &mut Sink, payload: Vec<u8>) -> Result<(), axum::Error> {
    sink.send(Message::Binary(payload.into())).await
}

/// Serve one collaboration connection on document `name`.
pub async fn run_sync_session(
    socket: WebSocket,
    registry: Arc<DocumentRegistry>,
    name: String,
    config: GatewayConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = socket.split();

    let attachment = match registry.attach(&name).await {
        Ok(attachment) => attachment,
        Err(e) => {
            log::error!("Failed to open document {name}: {e}");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: axum::extract::ws::close_code::ERROR,
                    reason: "Document unavailable".into(),
                })))
                .await;
            return;
        }
    };
    let document = attachment.document;
    let connection = attachment.connection_id;
    let mut updates = attachment.receiver;

    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    let mut close: Option<CloseFrame> = None;

    let mut healthy = true;
    for frame in attachment.initial_frames {
        if send_binary(&mut sink, frame).await.is_err() {
            healthy = false;
            break;
        }
    }

    while healthy {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        match document.receive(connection, &bytes).await {
                            Ok(Some(reply)) => {
                                if send_binary(&mut sink, reply).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => log::warn!("Dropping frame from {connection} on {name}: {e}"),
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        log::warn!("Ignoring text frame from {connection} on {name}");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Transport error on {connection}: {e}");
                        break;
                    }
                }
            }
            outbound = updates.recv() => {
                match outbound {
                    Ok(frame) => {
                        if frame.is_for(connection)
                            && send_binary(&mut sink, frame.payload.to_vec()).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("{connection} lagged {skipped} frames on {name}; resending full state");
                        let state = document.full_state_frame().await;
                        if send_binary(&mut sink, state).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                document.prune_awareness(config.awareness_timeout).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    close = Some(CloseFrame {
                        code: close_code::GOING_AWAY,
                        reason: "Server shutting down".into(),
                    });
                    break;
                }
            }
        }
    }

    if let Some(frame) = close {
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
    registry.detach(&document, connection).await;
}
