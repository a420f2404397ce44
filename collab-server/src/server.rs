//! HTTP + WebSocket listener.
//!
//! ```text
//! GET /health             → {status, documents, timestamp}
//! GET /stats              → {documents: [{name, connections}]}
//! WS  /terminal/<uuid>    → terminal gateway
//! WS  /<name>             → sync gateway for document <name>
//! ```
//!
//! Upgrades on a malformed path are accepted and immediately closed with
//! 4000 so the client sees a reason. Plain requests to unknown paths get 404.

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

use crate::cache::{FastCache, MemoryCache, RedisCache};
use crate::config::ServerConfig;
use crate::durable::{DurableStore, HttpDurableStore};
use crate::error::{close_code, ServerError};
use crate::gateway::{self, GatewayConfig};
use crate::persistence::PersistenceScheduler;
use crate::registry::{DocumentRegistry, DocumentStats};
use crate::terminal::{self, session, ShellConnector, SshConnector};

/// Where an upgrade request goes.
#[derive(Debug, PartialEq, Eq)]
pub enum Route {
    Document(String),
    Terminal(Uuid),
    Invalid(&'static str),
}

impl Route {
    /// Route a request path (query string already stripped).
    pub fn from_path(path: &str) -> Self {
        if session::is_terminal_path(path) {
            return match session::parse_session_path(path) {
                Ok(id) => Route::Terminal(id),
                Err(_) => Route::Invalid("Invalid terminal session path"),
            };
        }
        let raw = path.trim_start_matches('/');
        if raw.is_empty() {
            return Route::Invalid("Missing document name");
        }
        // Keys and backend URLs are built from the decoded name
        match percent_decode_str(raw).decode_utf8() {
            Ok(name) => Route::Document(name.into_owned()),
            Err(_) => Route::Invalid("Document name is not valid UTF-8"),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    documents: usize,
    timestamp: String,
}

#[derive(Serialize)]
struct StatsResponse {
    documents: Vec<DocumentStats>,
}

#[derive(Clone)]
struct AppState {
    registry: Arc<DocumentRegistry>,
    cache: Arc<dyn FastCache>,
    connector: Arc<dyn ShellConnector>,
    gateway: GatewayConfig,
    shutdown: watch::Receiver<bool>,
}

/// The collaboration server: registry, persistence and both gateways.
pub struct CollabServer {
    registry: Arc<DocumentRegistry>,
    state: AppState,
    shutdown: watch::Sender<bool>,
}

impl CollabServer {
    /// Assemble a server from explicit backends.
    pub fn new(
        config: &ServerConfig,
        cache: Arc<dyn FastCache>,
        store: Arc<dyn DurableStore>,
        connector: Arc<dyn ShellConnector>,
    ) -> Self {
        let scheduler = PersistenceScheduler::new(config, cache.clone(), store);
        let registry = DocumentRegistry::new(config, Arc::new(scheduler));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = AppState {
            registry: registry.clone(),
            cache,
            connector,
            gateway: GatewayConfig {
                ping_interval: config.ping_interval,
                awareness_timeout: config.awareness_timeout,
            },
            shutdown: shutdown_rx,
        };
        Self {
            registry,
            state,
            shutdown,
        }
    }

    /// Assemble a server from configuration: Redis (or memory) cache, HTTP
    /// durable store, SSH connector.
    pub async fn from_config(config: &ServerConfig) -> Result<Self, ServerError> {
        let cache: Arc<dyn FastCache> = match &config.redis_url {
            Some(url) => Arc::new(RedisCache::connect(url).await?),
            None => {
                log::warn!("REDIS_URL not set; using in-process cache");
                Arc::new(MemoryCache::new())
            }
        };
        let store = Arc::new(HttpDurableStore::new(
            &config.backend_url,
            config.backend_api_token.clone(),
        )?);
        let connector = Arc::new(SshConnector::new(config));
        Ok(Self::new(config, cache, store, connector))
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/stats", get(stats))
            .fallback(upgrade)
            .with_state(self.state.clone())
    }

    /// Serve until `signal` resolves, then close every socket (1001) and
    /// flush every live document.
    pub async fn serve<S>(self, listener: TcpListener, signal: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Collaboration server listening on {addr}");
        }
        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                signal.await;
                log::info!("Shutdown requested");
                let _ = shutdown.send(true);
            })
            .await?;

        self.registry.shutdown().await;
        log::info!("Server stopped");
        Ok(())
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        documents: state.registry.len().await,
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        documents: state.registry.stats().await,
    })
}

async fn upgrade(
    State(state): State<AppState>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(ws) = ws else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match Route::from_path(uri.path()) {
        Route::Document(name) => ws.on_upgrade(move |socket| {
            gateway::run_sync_session(socket, state.registry, name, state.gateway, state.shutdown)
        }),
        Route::Terminal(session_id) => ws.on_upgrade(move |socket| {
            terminal::run_terminal_session(
                socket,
                session_id,
                state.cache,
                state.connector,
                state.shutdown,
            )
        }),
        Route::Invalid(reason) => {
            log::warn!("Rejecting upgrade on {}: {reason}", uri.path());
            ws.on_upgrade(move |socket| reject(socket, reason))
        }
    }
}

async fn reject(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::INVALID_PATH,
            reason: reason.into(),
        })))
        .await;
}
