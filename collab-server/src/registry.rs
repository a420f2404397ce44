//! Document registry: which documents are live, and their lifecycle.
//!
//! ```text
//!            attach                 last detach
//!  Absent ───────────► Active ─────────────────► Draining
//!    ▲                   ▲                          │
//!    │                   └──── attach (GC cancel) ──┤
//!    └──────────── GC fires, still idle, evicted ◄──┘
//! ```
//!
//! The registry is constructed with a [`LifecycleHooks`] implementation
//! (normally the persistence scheduler) and shared behind an `Arc`.
//! Map mutations take the registry write lock; CRDT and awareness mutation
//! of one document is serialised by that document's own mutex, and fan-out
//! happens while it is held so peers see updates in processing order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, MutexGuard, OnceCell, RwLock};
use tokio::time::Instant;
use uuid::Uuid;
use yrs::block::ClientID;

use crate::awareness::AwarenessTracker;
use crate::broadcast::{BroadcastGroup, Outbound};
use crate::config::ServerConfig;
use crate::engine::DocumentEngine;
use crate::error::{EngineError, PersistError, ProtocolError};
use crate::protocol::{self, Frame};
use crate::timer::TimerSlot;

/// Callbacks driven by document lifecycle transitions.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// A document was created; runs before any connection sees it.
    async fn on_create(&self, _document: &Arc<Document>) {}

    /// Document content changed. Called synchronously while the document
    /// state lock is held: must not lock it again.
    fn on_change(&self, _document: &Arc<Document>) {}

    /// Last connection detached.
    async fn on_drain(&self, _document: &Arc<Document>) {}

    /// The document is about to be evicted. An error keeps it in memory
    /// and re-arms the GC timer.
    async fn on_evict(&self, _document: &Arc<Document>) -> Result<(), PersistError> {
        Ok(())
    }
}

/// Hooks that do nothing (in-memory only).
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// Mutable replicated state of a document.
pub struct DocumentState {
    pub engine: DocumentEngine,
    pub awareness: AwarenessTracker,
}

/// A live document.
pub struct Document {
    name: String,
    state: Mutex<DocumentState>,
    /// Connection → awareness client ids it controls.
    connections: parking_lot::Mutex<HashMap<Uuid, HashSet<ClientID>>>,
    broadcast: BroadcastGroup,
    ready: OnceCell<()>,
    save_timer: TimerSlot,
    gc_timer: TimerSlot,
    /// First change not yet written to the cache.
    dirty_since: parking_lot::Mutex<Option<Instant>>,
    /// Content may differ from the durable store.
    unsynced: AtomicBool,
    /// Bumped on every integrated change.
    revision: AtomicU64,
}

impl Document {
    fn create(
        name: &str,
        broadcast_capacity: usize,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Result<Arc<Self>, EngineError> {
        let mut engine = DocumentEngine::new()?;
        let broadcast = BroadcastGroup::new(broadcast_capacity);

        let fanout = broadcast.clone();
        engine.subscribe(move |update| {
            fanout.send(DocumentEngine::encode_update_for_broadcast(update));
        });

        Ok(Arc::new_cyclic(|weak: &Weak<Document>| {
            let weak = weak.clone();
            engine.subscribe(move |_| {
                if let Some(document) = weak.upgrade() {
                    document.revision.fetch_add(1, Ordering::SeqCst);
                    document.unsynced.store(true, Ordering::SeqCst);
                    hooks.on_change(&document);
                }
            });

            Document {
                name: name.to_string(),
                state: Mutex::new(DocumentState {
                    engine,
                    awareness: AwarenessTracker::new(),
                }),
                connections: parking_lot::Mutex::new(HashMap::new()),
                broadcast,
                ready: OnceCell::new(),
                save_timer: TimerSlot::new(),
                gc_timer: TimerSlot::new(),
                dirty_since: parking_lot::Mutex::new(None),
                unsynced: AtomicBool::new(false),
                revision: AtomicU64::new(0),
            }
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the replicated state.
    pub async fn lock(&self) -> MutexGuard<'_, DocumentState> {
        self.state.lock().await
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn save_timer(&self) -> &TimerSlot {
        &self.save_timer
    }

    pub fn gc_timer(&self) -> &TimerSlot {
        &self.gc_timer
    }

    /// Record a pending change; returns when the first pending one happened.
    pub fn mark_dirty(&self) -> Instant {
        *self.dirty_since.lock().get_or_insert_with(Instant::now)
    }

    /// Clear the pending-change marker ahead of a flush.
    pub fn clear_dirty(&self) -> bool {
        self.dirty_since.lock().take().is_some()
    }

    pub fn is_unsynced(&self) -> bool {
        self.unsynced.load(Ordering::SeqCst)
    }

    pub fn mark_unsynced(&self) {
        self.unsynced.store(true, Ordering::SeqCst);
    }

    /// Clear the unsynced flag ahead of a durable push and return its old
    /// value. Edits that land after this set it again.
    pub fn take_unsynced(&self) -> bool {
        self.unsynced.swap(false, Ordering::SeqCst)
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Handle one binary frame from `connection`.
    ///
    /// Returns the reply meant for the sender only, if any. Changes are fanned
    /// out to the other connections through the broadcast group.
    pub async fn receive(
        &self,
        connection: Uuid,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let frame = protocol::decode(bytes)?;
        log::trace!("{} <- {connection}: {}", self.name, frame.kind());

        let mut state = self.state.lock().await;
        match frame {
            Frame::SyncStep1(remote) => {
                let diff = state.engine.encode_diff(&remote);
                Ok(Some(protocol::encode_sync_step2(diff)))
            }
            Frame::SyncStep2(update) | Frame::Update(update) => {
                if let Err(e) = state.engine.apply_local_update(&update, Some(connection)) {
                    log::warn!("Dropping update from {connection} on {}: {e}", self.name);
                }
                Ok(None)
            }
            Frame::Awareness(update) => {
                let change = state.awareness.apply_update(update);
                if change.is_empty() {
                    return Ok(None);
                }
                {
                    let mut connections = self.connections.lock();
                    if let Some(controlled) = connections.get_mut(&connection) {
                        controlled.extend(change.added.iter().copied());
                        controlled.extend(change.updated.iter().copied());
                        for id in &change.removed {
                            controlled.remove(id);
                        }
                    }
                }
                let changed: Vec<ClientID> = change
                    .added
                    .iter()
                    .chain(&change.updated)
                    .chain(&change.removed)
                    .copied()
                    .collect();
                if let Some(delta) = state.awareness.encode_current_state(&changed) {
                    self.broadcast.send(Outbound::to_all(protocol::encode_awareness(delta)));
                }
                Ok(None)
            }
            Frame::AwarenessQuery => Ok(state.awareness.encode_all().map(protocol::encode_awareness)),
        }
    }

    /// The whole document as one update frame (resync after lag).
    pub async fn full_state_frame(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        protocol::encode_update(&state.engine.encode_full_state())
    }

    /// Drop presence entries not refreshed within `timeout` and broadcast
    /// their removal. Returns how many were dropped.
    pub async fn prune_awareness(&self, timeout: Duration) -> usize {
        let mut state = self.state.lock().await;
        let (pruned, removal) = state.awareness.prune_outdated(timeout);
        if pruned.is_empty() {
            return 0;
        }
        for controlled in self.connections.lock().values_mut() {
            for id in &pruned {
                controlled.remove(id);
            }
        }
        if let Some(removal) = removal {
            self.broadcast.send(Outbound::to_all(protocol::encode_awareness(removal)));
        }
        log::debug!("Pruned {} stale presence entries on {}", pruned.len(), self.name);
        pruned.len()
    }

    async fn initial_frames(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        let mut frames = vec![protocol::encode_sync_step1(state.engine.state_vector())];
        if let Some(snapshot) = state.awareness.encode_all() {
            frames.push(protocol::encode_awareness(snapshot));
        }
        frames
    }
}

/// A connection's handle on a document.
pub struct Attachment {
    pub document: Arc<Document>,
    pub connection_id: Uuid,
    pub receiver: broadcast::Receiver<Outbound>,
    /// Sync step-1, then the awareness snapshot if anyone is present.
    pub initial_frames: Vec<Vec<u8>>,
}

/// Per-document entry of [`DocumentRegistry::stats`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DocumentStats {
    pub name: String,
    pub connections: usize,
}

/// Process-wide map of live documents.
pub struct DocumentRegistry {
    documents: RwLock<HashMap<String, Arc<Document>>>,
    hooks: Arc<dyn LifecycleHooks>,
    gc_delay: Duration,
    broadcast_capacity: usize,
}

impl DocumentRegistry {
    pub fn new(config: &ServerConfig, hooks: Arc<dyn LifecycleHooks>) -> Arc<Self> {
        Arc::new(Self {
            documents: RwLock::new(HashMap::new()),
            hooks,
            gc_delay: config.gc_delay,
            broadcast_capacity: config.broadcast_capacity,
        })
    }

    /// Attach a new connection to `name`, creating the document if needed.
    pub async fn attach(&self, name: &str) -> Result<Attachment, EngineError> {
        let connection_id = Uuid::new_v4();

        let (document, receiver) = {
            let mut documents = self.documents.write().await;
            let document = match documents.get(name) {
                Some(existing) => existing.clone(),
                None => {
                    let created = Document::create(name, self.broadcast_capacity, self.hooks.clone())?;
                    documents.insert(name.to_string(), created.clone());
                    log::info!("Created document {name}");
                    created
                }
            };
            if document.gc_timer.cancel() {
                log::debug!("Reconnect to {name} cancelled eviction");
            }
            document.connections.lock().insert(connection_id, HashSet::new());
            let receiver = document.broadcast.subscribe();
            (document, receiver)
        };

        let hooks = self.hooks.clone();
        document
            .ready
            .get_or_init(|| async { hooks.on_create(&document).await })
            .await;

        let initial_frames = document.initial_frames().await;
        log::info!(
            "Connection {connection_id} attached to {name} ({} connected)",
            document.connection_count()
        );

        Ok(Attachment {
            document,
            connection_id,
            receiver,
            initial_frames,
        })
    }

    /// Detach a connection: clear its presence, and start draining the
    /// document if it was the last one.
    pub async fn detach(self: &Arc<Self>, document: &Arc<Document>, connection: Uuid) {
        let (controlled, remaining) = {
            let mut connections = document.connections.lock();
            let controlled = connections.remove(&connection);
            (controlled, connections.len())
        };
        let Some(controlled) = controlled else {
            return;
        };
        log::info!(
            "Connection {connection} detached from {} ({remaining} connected)",
            document.name
        );

        if !controlled.is_empty() {
            let ids: Vec<ClientID> = controlled.into_iter().collect();
            let mut state = document.state.lock().await;
            if let Some(removal) = state.awareness.remove_states(&ids) {
                document
                    .broadcast
                    .send(Outbound::to_all(protocol::encode_awareness(removal)));
            }
        }

        if remaining == 0 {
            self.hooks.on_drain(document).await;
            if document.connection_count() == 0 {
                self.arm_gc(document);
            }
        }
    }

    fn arm_gc(self: &Arc<Self>, document: &Arc<Document>) {
        let registry = Arc::downgrade(self);
        let target = Arc::downgrade(document);
        log::debug!("Draining {}; eviction in {:?}", document.name, self.gc_delay);
        document.gc_timer.schedule(self.gc_delay, move || async move {
            if let (Some(registry), Some(document)) = (registry.upgrade(), target.upgrade()) {
                registry.collect(document).await;
            }
        });
    }

    /// GC firing: flush and evict if the document is still idle.
    async fn collect(self: Arc<Self>, document: Arc<Document>) {
        if document.connection_count() > 0 {
            return;
        }

        let revision = document.revision();
        let flushed = self.hooks.on_evict(&document).await;

        let mut documents = self.documents.write().await;
        let current = documents
            .get(&document.name)
            .is_some_and(|d| Arc::ptr_eq(d, &document));
        if !current || document.connection_count() > 0 {
            log::debug!("{} became active during eviction; keeping it", document.name);
            return;
        }
        if document.revision() != revision {
            drop(documents);
            log::debug!("{} changed during eviction; rescheduling", document.name);
            self.arm_gc(&document);
            return;
        }

        match flushed {
            Ok(()) => {
                documents.remove(&document.name);
                log::info!("Evicted idle document {}", document.name);
            }
            Err(e) => {
                drop(documents);
                log::error!("Keeping {} in memory: {e}", document.name);
                self.arm_gc(&document);
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Document>> {
        self.documents.read().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Name and connection count of every live document, sorted by name.
    pub async fn stats(&self) -> Vec<DocumentStats> {
        let documents = self.documents.read().await;
        let mut stats: Vec<DocumentStats> = documents
            .values()
            .map(|d| DocumentStats {
                name: d.name.clone(),
                connections: d.connection_count(),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Flush and drop every live document (graceful process shutdown).
    pub async fn shutdown(&self) {
        let documents: Vec<Arc<Document>> = {
            let mut documents = self.documents.write().await;
            documents.drain().map(|(_, d)| d).collect()
        };
        log::info!("Flushing {} documents before shutdown", documents.len());
        for document in documents {
            document.gc_timer.cancel();
            if let Err(e) = self.hooks.on_evict(&document).await {
                log::error!("Shutdown flush of {} failed: {e}", document.name);
            }
        }
    }
}
