//! # collab-server: real-time collaborative document sync
//!
//! Clients edit shared text/rich-text documents over WebSocket and converge
//! through a Yjs-compatible CRDT. Content is written back through tiered
//! storage and idle documents are evicted from memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   WebSocket (y-protocols)   ┌──────────────┐
//! │ Client A │ ◄─────────────────────────► │ Sync gateway │──┐
//! └──────────┘                             └──────────────┘  │
//! ┌──────────┐                             ┌──────────────┐  ▼
//! │ Client B │ ◄─────────────────────────► │ Sync gateway │─► DocumentRegistry
//! └──────────┘                             └──────────────┘   │  (per document: engine,
//!                                                             │   awareness, fan-out)
//!                                                             ▼
//!                                                   PersistenceScheduler
//!                                                    │ debounce      │ idle
//!                                                    ▼               ▼
//!                                               Fast cache ──► Durable store
//! ```
//!
//! A second gateway relays interactive SSH shells, authorised by one-time
//! session ids consumed from the fast cache.
//!
//! ## Modules
//!
//! - [`engine`]: CRDT document (text + XML fragment views)
//! - [`awareness`]: ephemeral presence
//! - [`protocol`]: binary sync framing
//! - [`broadcast`]: per-document fan-out
//! - [`registry`]: document lifecycle and GC
//! - [`persistence`]: debounced cache writes, durable push on eviction
//! - [`cache`] / [`durable`]: storage tiers
//! - [`gateway`] / [`terminal`]: WebSocket handlers
//! - [`server`]: HTTP listener, routing, graceful shutdown

pub mod awareness;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod durable;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod terminal;
pub mod timer;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessTracker};
pub use broadcast::{BroadcastGroup, Outbound};
pub use cache::{FastCache, MemoryCache, RedisCache};
pub use config::ServerConfig;
pub use durable::{DocumentContent, DurableStore, HttpDurableStore};
pub use engine::{DocumentEngine, EngineUpdate, SubscriptionId};
pub use error::{
    CacheError, ConfigError, EngineError, PersistError, ProtocolError, ServerError, StoreError,
    TerminalError,
};
pub use persistence::{CachedDocument, PersistenceScheduler};
pub use registry::{Attachment, Document, DocumentRegistry, DocumentStats, LifecycleHooks};
pub use server::{CollabServer, Route};
pub use terminal::{Credentials, PtySize, RemoteShell, ShellConnector, SshConnector};
pub use timer::TimerSlot;
