//! CRDT document engine.
//!
//! One `DocumentEngine` per live document. It owns a Yrs `Doc` exposing a
//! plain text view (`content`) and a rich-text XML fragment (`default`) of
//! the same logical document. All mutation goes through
//! [`DocumentEngine::apply_local_update`]; changes are announced to
//! subscribers registered with [`DocumentEngine::subscribe`].
//!
//! ```text
//! client update ──► apply_local_update ──► yrs::Doc
//!                                             │ (changed?)
//!                            ┌────────────────┴───────────────┐
//!                            ▼                                ▼
//!                     fan-out listener                 persistence listener
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, ReadTxn, StateVector, Subscription, Text, TextRef, Transact, Update,
    XmlFragmentRef,
};

use crate::broadcast::Outbound;
use crate::error::EngineError;
use crate::protocol;

/// Root name of the plain text view.
pub const TEXT_ROOT: &str = "content";
/// Root name of the rich-text fragment view.
pub const FRAGMENT_ROOT: &str = "default";

/// Handle returned by [`DocumentEngine::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A change that was integrated into the engine.
#[derive(Debug, Clone)]
pub struct EngineUpdate {
    /// Yrs v1 update describing exactly what changed
    pub update: Arc<Vec<u8>>,
    /// Connection the change came from (None = server-side)
    pub origin: Option<Uuid>,
}

type Listener = Arc<dyn Fn(&EngineUpdate) + Send + Sync>;

/// Replicated state of one document.
pub struct DocumentEngine {
    doc: Doc,
    text: TextRef,
    fragment: XmlFragmentRef,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
    /// Filled by the Yrs update observer during a commit.
    committed: Arc<Mutex<Option<Vec<u8>>>>,
    _observer: Subscription,
}

impl DocumentEngine {
    /// Create an empty engine.
    pub fn new() -> Result<Self, EngineError> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_ROOT);
        let fragment = doc.get_or_insert_xml_fragment(FRAGMENT_ROOT);

        let committed = Arc::new(Mutex::new(None));
        let slot = committed.clone();
        let observer = doc
            .observe_update_v1(move |_txn, event| {
                *slot.lock() = Some(event.update.clone());
            })
            .map_err(|e| EngineError::Observe(e.to_string()))?;

        Ok(Self {
            doc,
            text,
            fragment,
            listeners: Vec::new(),
            next_subscription: 0,
            committed,
            _observer: observer,
        })
    }

    /// Register a listener for integrated changes.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: Fn(&EngineUpdate) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    /// Integrate an encoded update from a client.
    ///
    /// Returns `true` when the document changed; listeners are notified
    /// synchronously before returning. Redelivered or already-known updates
    /// return `false` and notify nobody.
    pub fn apply_local_update(
        &mut self,
        encoded: &[u8],
        origin: Option<Uuid>,
    ) -> Result<bool, EngineError> {
        let update = Update::decode_v1(encoded).map_err(|e| EngineError::Decode(e.to_string()))?;

        self.committed.lock().take();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| EngineError::Apply(e.to_string()))?;
        }

        let Some(applied) = self.committed.lock().take() else {
            return Ok(false);
        };

        let event = EngineUpdate {
            update: Arc::new(applied),
            origin,
        };
        for (_, listener) in &self.listeners {
            listener(&event);
        }
        Ok(true)
    }

    /// Wrap an integrated change as a sync frame for every connection except its origin.
    pub fn encode_update_for_broadcast(update: &EngineUpdate) -> Outbound {
        Outbound::new(update.origin, protocol::encode_update(&update.update))
    }

    /// Current state vector.
    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Everything the holder of `remote` is missing, as a v1 update.
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(remote)
    }

    /// The whole document as a single v1 update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        self.encode_diff(&StateVector::default())
    }

    /// Materialized text view.
    pub fn snapshot_text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Materialized rich-text view (XML string of the fragment).
    pub fn snapshot_rich_text(&self) -> String {
        let txn = self.doc.transact();
        self.fragment.get_string(&txn)
    }

    /// Whether the text view is empty.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.text.len(&txn) == 0
    }

    /// Insert previously persisted content into an empty text view.
    ///
    /// Does nothing if the view already has content. Listeners are not
    /// notified: seeding restores state, it is not an edit.
    pub fn seed_text(&mut self, content: &str) -> bool {
        if content.is_empty() || !self.is_empty() {
            return false;
        }
        {
            let mut txn = self.doc.transact_mut();
            self.text.insert(&mut txn, 0, content);
        }
        self.committed.lock().take();
        true
    }
}
