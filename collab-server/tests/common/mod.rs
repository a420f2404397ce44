//! Shared harness: a real server on an ephemeral port, y-protocols test
//! peers, a mock durable-store backend and a mock shell connector.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, WriteTxn};

use collab_server::protocol::{self, Frame};
use collab_server::{
    CollabServer, Credentials, DocumentRegistry, DurableStore, FastCache, HttpDurableStore,
    PtySize, RemoteShell, ServerConfig, ShellConnector, TerminalError,
};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

/// Config with timers short enough for tests.
pub fn fast_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        save_debounce: Duration::from_millis(50),
        save_max_debounce: Duration::from_millis(500),
        gc_delay: Duration::from_millis(200),
        ..ServerConfig::default()
    }
}

// ─── Server ──────────────────────────────────────────────────────────

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: Arc<DocumentRegistry>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(
        config: ServerConfig,
        cache: Arc<dyn FastCache>,
        store: Arc<dyn DurableStore>,
        connector: Arc<dyn ShellConnector>,
    ) -> Self {
        let listener = TcpListener::bind(&config.bind_addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = CollabServer::new(&config, cache, store, connector);
        let registry = server.registry().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, async move {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            registry,
            stop: Some(stop),
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = timeout(WAIT, self.handle).await;
    }
}

/// Poll `condition` until it holds or the wait runs out.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ─── Sync peer ───────────────────────────────────────────────────────

/// A client replica speaking the sync protocol, like a browser editor.
pub struct TestPeer {
    pub doc: Doc,
    ws: Ws,
    pub awareness_frames: usize,
}

impl TestPeer {
    pub async fn connect(server: &TestServer, name: &str) -> Self {
        let (ws, _) = connect_async(server.url(&format!("/{name}"))).await.unwrap();
        let mut peer = Self {
            doc: Doc::new(),
            ws,
            awareness_frames: 0,
        };
        let step1 = protocol::encode_sync_step1(peer.doc.transact().state_vector());
        peer.send(step1).await;
        peer
    }

    pub async fn send(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    /// Append `chunk` locally and send the update.
    pub async fn append(&mut self, chunk: &str) {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.len(&txn);
            text.insert(&mut txn, len, chunk);
        }
        let update = self.doc.transact().encode_state_as_update_v1(&before);
        self.send(protocol::encode_update(&update)).await;
    }

    pub fn text(&self) -> String {
        let text = self.doc.get_or_insert_text("content");
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    /// Handle one inbound frame. Returns false once the socket is closed.
    pub async fn pump(&mut self) -> bool {
        let Some(Ok(message)) = self.ws.next().await else {
            return false;
        };
        match message {
            Message::Binary(bytes) => match protocol::decode(&bytes) {
                Ok(Frame::SyncStep1(remote)) => {
                    let diff = self.doc.transact().encode_state_as_update_v1(&remote);
                    self.send(protocol::encode_sync_step2(diff)).await;
                }
                Ok(Frame::SyncStep2(update)) | Ok(Frame::Update(update)) => {
                    let update = Update::decode_v1(&update).unwrap();
                    self.doc.transact_mut().apply_update(update).unwrap();
                }
                Ok(Frame::Awareness(_)) => self.awareness_frames += 1,
                _ => {}
            },
            Message::Close(_) => return false,
            _ => {}
        }
        true
    }

    /// Pump frames until the text equals `expected`.
    pub async fn wait_for_text(&mut self, expected: &str) {
        let reached = timeout(WAIT, async {
            while self.text() != expected {
                if !self.pump().await {
                    break;
                }
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {expected:?}, have {:?}", self.text());
        assert_eq!(self.text(), expected);
    }

    /// Pump until at least `count` awareness frames arrived.
    pub async fn wait_for_awareness(&mut self, count: usize) {
        let reached = timeout(WAIT, async {
            while self.awareness_frames < count {
                if !self.pump().await {
                    break;
                }
            }
        })
        .await;
        assert!(reached.is_ok() && self.awareness_frames >= count);
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        let _ = timeout(WAIT, async { while self.ws.next().await.is_some() {} }).await;
    }
}

/// Read until the server closes; returns the close code and reason, and
/// any text frames seen first.
pub async fn expect_close(ws: &mut Ws) -> (u16, String, Vec<String>) {
    let mut texts = Vec::new();
    let result = timeout(WAIT, async {
        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Close(Some(frame))) => {
                    return Some((u16::from(frame.code), frame.reason.to_string()));
                }
                Ok(Message::Text(text)) => texts.push(text.to_string()),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    })
    .await;
    let (code, reason) = result
        .ok()
        .flatten()
        .expect("expected a close frame from the server");
    (code, reason, texts)
}

/// Next JSON text frame.
pub async fn next_json(ws: &mut Ws) -> serde_json::Value {
    let message = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap();
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected a JSON frame, got {other:?}"),
            }
        }
    })
    .await;
    message.expect("timed out waiting for a JSON frame")
}

// ─── Durable store backend ───────────────────────────────────────────

/// Stand-in for the host application's document API.
#[derive(Clone, Default)]
pub struct MockBackend {
    pub pushes: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    pub stored: Arc<Mutex<HashMap<String, String>>>,
    pub fail_push: Arc<AtomicBool>,
}

impl MockBackend {
    /// Serve on an ephemeral port; returns the backend and its base URL.
    pub async fn start() -> (Self, String) {
        let backend = Self::default();
        let app = Router::new()
            .route("/api/v1/documents/public/{name}/sync", post(push))
            .route("/api/v1/documents/public/{name}", get(fetch))
            .with_state(backend.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (backend, url)
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }

    /// A durable store client pointed at this backend.
    pub fn client(url: &str) -> Arc<dyn DurableStore> {
        Arc::new(HttpDurableStore::new(url, None).unwrap())
    }
}

async fn push(
    State(backend): State<MockBackend>,
    Path(name): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    if backend.fail_push.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if let Some(content) = body["content"].as_str() {
        backend.stored.lock().insert(name.clone(), content.to_string());
    }
    backend.pushes.lock().push((name, body));
    StatusCode::OK
}

async fn fetch(State(backend): State<MockBackend>, Path(name): Path<String>) -> Response {
    match backend.stored.lock().get(&name) {
        Some(content) => Json(serde_json::json!({ "name": name, "content": content })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ─── Shell connector ─────────────────────────────────────────────────

/// Opens echo shells: input comes straight back as output, `exit\r`
/// ends the shell.
#[derive(Default)]
pub struct MockConnector {
    pub opened: Mutex<Vec<String>>,
    pub resizes: Arc<Mutex<Vec<PtySize>>>,
    pub closed: Arc<AtomicUsize>,
    pub reject_auth: AtomicBool,
}

#[async_trait]
impl ShellConnector for MockConnector {
    async fn open(
        &self,
        credentials: &Credentials,
        _size: PtySize,
    ) -> Result<Box<dyn RemoteShell>, TerminalError> {
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(TerminalError::AuthFailed {
                host: credentials.host.clone(),
                username: credentials.username.clone(),
            });
        }
        self.opened.lock().push(credentials.username.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(EchoShell {
            tx: Some(tx),
            rx,
            resizes: self.resizes.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct EchoShell {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    resizes: Arc<Mutex<Vec<PtySize>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteShell for EchoShell {
    async fn read(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        if data == b"exit\r" {
            self.tx = None;
            return Ok(());
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(data.to_vec());
        }
        Ok(())
    }

    async fn resize(&mut self, size: PtySize) -> Result<(), TerminalError> {
        self.resizes.lock().push(size);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
