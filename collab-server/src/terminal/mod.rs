//! Terminal session gateway.
//!
//! Turns a one-time session id into an interactive remote shell relayed
//! over a WebSocket:
//!
//! ```text
//! AwaitingHandshake ──(session consumed)──► Authenticating ──(shell ready)──► Streaming
//!         │                                       │                              │
//!         └──────────── close 4001/4002 ──────────┴──── close 4003/4004/4005 ────┴──► Closed
//! ```
//!
//! The session id is deleted from the cache before the remote host is even
//! contacted, so it can never authenticate a second connection.

pub mod protocol;
pub mod session;
pub mod ssh;

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::FastCache;
use crate::error::{close_code, TerminalError};

pub use protocol::{ClientFrame, ClientMessage, ServerMessage};
pub use session::{AuthMethod, Credentials};
pub use ssh::{PtySize, RemoteShell, ShellConnector, SshConnector};

type Sink = SplitSink<WebSocket, Message>;

async fn send(sink: &mut Sink, message: &ServerMessage) -> Result<(), axum::Error> {
    sink.send(Message::Text(message.to_json().into())).await
}

async fn close(sink: &mut Sink, code: u16, reason: String) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Report `error` to the client and close with its code.
async fn fail(sink: &mut Sink, session_id: &Uuid, error: TerminalError) {
    log::warn!("Terminal session {session_id} failed: {error}");
    let message = error.to_string();
    let _ = send(sink, &ServerMessage::Error { message: message.clone() }).await;
    close(sink, error.close_code(), message).await;
}

/// How a streaming session ended.
enum Ending {
    ClientClosed,
    ShellClosed,
    Shutdown,
}

/// Serve one terminal connection for `session_id`.
pub async fn run_terminal_session(
    socket: WebSocket,
    session_id: Uuid,
    cache: Arc<dyn FastCache>,
    connector: Arc<dyn ShellConnector>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = socket.split();

    let credentials = match session::consume(cache.as_ref(), &session_id).await {
        Ok(credentials) => credentials,
        Err(e) => return fail(&mut sink, &session_id, e).await,
    };

    let mut shell = match connector.open(&credentials, PtySize::default()).await {
        Ok(shell) => shell,
        Err(e) => return fail(&mut sink, &session_id, e).await,
    };
    log::info!(
        "Terminal session {session_id} connected to {}@{}",
        credentials.username,
        credentials.host
    );

    let connected = ServerMessage::Connected {
        host: credentials.host.clone(),
        username: credentials.username.clone(),
    };
    let mut ending = Ending::ClientClosed;
    if send(&mut sink, &connected).await.is_ok() {
        ending = loop {
            tokio::select! {
                incoming = stream.next() => {
                    let data = match incoming {
                        Some(Ok(Message::Text(text))) => match ClientFrame::parse(text.as_str()) {
                            ClientFrame::Control(ClientMessage::Resize { rows, cols }) => {
                                if let Err(e) = shell.resize(PtySize { cols, rows }).await {
                                    log::warn!("Resize on {session_id} failed: {e}");
                                }
                                continue;
                            }
                            ClientFrame::Control(ClientMessage::Input { data }) => data.into_bytes(),
                            ClientFrame::Raw(bytes) => bytes,
                            ClientFrame::Invalid(reason) => {
                                log::warn!("Dropping control frame on {session_id}: {reason}");
                                continue;
                            }
                        },
                        Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                        Some(Ok(Message::Close(_))) | None => break Ending::ClientClosed,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::debug!("Terminal transport error on {session_id}: {e}");
                            break Ending::ClientClosed;
                        }
                    };
                    if let Err(e) = shell.write(&data).await {
                        log::warn!("Write to remote shell on {session_id} failed: {e}");
                        break Ending::ShellClosed;
                    }
                }
                output = shell.read() => {
                    match output {
                        Some(bytes) => {
                            if send(&mut sink, &ServerMessage::output(&bytes)).await.is_err() {
                                break Ending::ClientClosed;
                            }
                        }
                        None => break Ending::ShellClosed,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ending::Shutdown;
                    }
                }
            }
        };
    }

    shell.close().await;
    match ending {
        Ending::ClientClosed => {}
        Ending::ShellClosed => {
            let _ = send(&mut sink, &ServerMessage::Disconnected).await;
            close(&mut sink, close_code::NORMAL, "Remote shell closed".to_string()).await;
        }
        Ending::Shutdown => {
            let _ = send(&mut sink, &ServerMessage::Disconnected).await;
            close(&mut sink, close_code::GOING_AWAY, "Server shutting down".to_string()).await;
        }
    }
    log::info!("Terminal session {session_id} closed");
}
