//! Tiered write-back of document content.
//!
//! ```text
//! edit ──► debounce ──► fast cache  collab:doc:<name>   (tier 2, TTL)
//! idle ──► GC fires ──► fast cache ──► durable store     (tier 3)
//!                                   └► cache entry deleted on success
//! ```
//!
//! Each document has a single save timer. An edit restarts it, so a burst
//! of edits produces one cache write; a pending save is still never pushed
//! back more than `max_debounce` past the first edit of the burst.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cache::{document_key, FastCache};
use crate::config::ServerConfig;
use crate::durable::{DocumentContent, DurableStore};
use crate::error::{CacheError, PersistError};
use crate::registry::{Document, LifecycleHooks};

/// Value stored under `collab:doc:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDocument {
    pub content: String,
    #[serde(default)]
    pub xml_content: String,
    pub updated_at: DateTime<Utc>,
}

impl CachedDocument {
    fn parse(key: &str, raw: &str) -> Result<Self, CacheError> {
        serde_json::from_str(raw).map_err(|source| CacheError::Payload {
            key: key.to_string(),
            source,
        })
    }
}

/// Debounced cache writes, durable push on eviction, seeding on creation.
#[derive(Clone)]
pub struct PersistenceScheduler {
    cache: Arc<dyn FastCache>,
    store: Arc<dyn DurableStore>,
    debounce: Duration,
    max_debounce: Duration,
    ttl: Duration,
}

impl PersistenceScheduler {
    pub fn new(
        config: &ServerConfig,
        cache: Arc<dyn FastCache>,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self {
            cache,
            store,
            debounce: config.save_debounce,
            max_debounce: config.save_max_debounce.max(config.save_debounce),
            ttl: config.cache_ttl,
        }
    }

    /// (Re)start the save timer of `document`.
    pub fn schedule_save(&self, document: &Arc<Document>) {
        let first_change = document.mark_dirty();
        let deadline = first_change + self.max_debounce;
        let delay = self
            .debounce
            .min(deadline.saturating_duration_since(Instant::now()));

        let scheduler = self.clone();
        let target = Arc::downgrade(document);
        document.save_timer().schedule(delay, move || async move {
            if let Some(document) = target.upgrade() {
                if let Err(e) = scheduler.flush_to_cache(&document).await {
                    log::warn!("Debounced save of {} failed: {e}", document.name());
                }
            }
        });
    }

    /// Write both views of `document` to the fast cache.
    pub async fn flush_to_cache(&self, document: &Document) -> Result<CachedDocument, PersistError> {
        document.clear_dirty();
        let cached = {
            let state = document.lock().await;
            CachedDocument {
                content: state.engine.snapshot_text(),
                xml_content: state.engine.snapshot_rich_text(),
                updated_at: Utc::now(),
            }
        };
        let key = document_key(document.name());
        let raw = serde_json::to_string(&cached).map_err(|source| PersistError::Encode {
            name: document.name().to_string(),
            source,
        })?;
        self.cache.set_ex(&key, &raw, self.ttl).await?;
        log::debug!("Saved {} to cache ({} chars)", document.name(), cached.content.len());
        Ok(cached)
    }

    /// Final flush of an idle document: cache, then durable store, then
    /// drop the cache entry.
    ///
    /// Succeeds when the content reached at least one tier.
    pub async fn flush_to_durable(&self, document: &Document) -> Result<(), PersistError> {
        let name = document.name();
        let key = document_key(name);

        // Cleared before the snapshot so edits made during the push survive
        document.take_unsynced();
        let cached = match self.flush_to_cache(document).await {
            Ok(written) => match self.read_back(&key).await {
                Some(stored) => Some(stored),
                None => Some(written),
            },
            Err(e) => {
                log::warn!("Cache flush of {name} failed: {e}");
                None
            }
        };
        let cache_ok = cached.is_some();

        let body = match cached {
            Some(cached) => DocumentContent {
                content: cached.content,
                xml_content: cached.xml_content,
            },
            None => {
                let state = document.lock().await;
                DocumentContent {
                    content: state.engine.snapshot_text(),
                    xml_content: state.engine.snapshot_rich_text(),
                }
            }
        };

        match self.store.push(name, &body).await {
            Ok(()) => {
                log::info!("Persisted {name} to durable store");
                self.release_cache_entry(&key, &body).await;
                Ok(())
            }
            Err(e) if cache_ok => {
                document.mark_unsynced();
                log::warn!("Durable push of {name} failed, cache entry kept for retry: {e}");
                Ok(())
            }
            Err(e) => {
                document.mark_unsynced();
                log::error!("Durable push of {name} failed: {e}");
                Err(PersistError::Unflushed {
                    name: name.to_string(),
                })
            }
        }
    }

    async fn read_back(&self, key: &str) -> Option<CachedDocument> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match CachedDocument::parse(key, &raw) {
                Ok(cached) => Some(cached),
                Err(e) => {
                    log::warn!("{e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("Reading back {key} failed: {e}");
                None
            }
        }
    }

    /// Delete the cache entry unless it was rewritten after the push.
    async fn release_cache_entry(&self, key: &str, pushed: &DocumentContent) {
        let unchanged = self.read_back(key).await.map_or(true, |current| {
            current.content == pushed.content && current.xml_content == pushed.xml_content
        });
        if !unchanged {
            log::debug!("{key} was rewritten during the durable push; keeping it");
            return;
        }
        if let Err(e) = self.cache.delete(key).await {
            log::warn!("Failed to delete {key}: {e}");
        }
    }

    /// Fill an empty, freshly created document from the cache, falling back
    /// to the durable store when the cache entry has expired.
    pub async fn seed(&self, document: &Document) {
        let name = document.name();
        if !document.lock().await.engine.is_empty() {
            return;
        }

        let key = document_key(name);
        let from_cache = match self.cache.get(&key).await {
            Ok(Some(raw)) => match CachedDocument::parse(&key, &raw) {
                Ok(cached) => Some(cached.content),
                Err(e) => {
                    log::warn!("{e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("Cache lookup for {name} failed: {e}");
                None
            }
        };

        let (content, cached) = match from_cache {
            Some(content) => (content, true),
            None => match self.store.fetch(name).await {
                Ok(Some(content)) => (content, false),
                Ok(None) => return,
                Err(e) => {
                    log::warn!("Durable fetch for {name} failed: {e}");
                    return;
                }
            },
        };

        let seeded = document.lock().await.engine.seed_text(&content);
        if seeded {
            // The cache may hold content the durable store never received
            if cached {
                document.mark_unsynced();
            }
            let source = if cached { "cache" } else { "durable store" };
            log::info!("Seeded {name} from {source} ({} chars)", content.len());
        }
    }
}

#[async_trait]
impl LifecycleHooks for PersistenceScheduler {
    async fn on_create(&self, document: &Arc<Document>) {
        self.seed(document).await;
    }

    fn on_change(&self, document: &Arc<Document>) {
        self.schedule_save(document);
    }

    async fn on_drain(&self, document: &Arc<Document>) {
        document.save_timer().cancel();
        if !document.is_unsynced() {
            return;
        }
        if let Err(e) = self.flush_to_cache(document).await {
            log::warn!("Drain flush of {} failed: {e}", document.name());
        }
    }

    async fn on_evict(&self, document: &Arc<Document>) -> Result<(), PersistError> {
        document.save_timer().cancel();
        if !document.is_unsynced() {
            log::debug!("{} has no unsynced content", document.name());
            return Ok(());
        }
        self.flush_to_durable(document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::StoreError;
    use crate::protocol;
    use crate::registry::DocumentRegistry;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use yrs::{Doc, ReadTxn, Text, Transact, WriteTxn};

    /// Memory cache that counts writes.
    #[derive(Default)]
    struct CountingCache {
        inner: MemoryCache,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl FastCache for CountingCache {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set_ex(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }

        async fn take(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.take(key).await
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        pushed: Mutex<Vec<(String, DocumentContent)>>,
        stored: Mutex<Option<String>>,
        fail: AtomicBool,
        /// While set, pushes wait for `release` after signalling `entered`.
        gated: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DurableStore for RecordingStore {
        async fn push(&self, name: &str, content: &DocumentContent) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Rejected {
                    name: name.to_string(),
                    status: 503,
                });
            }
            if self.gated.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            *self.stored.lock() = Some(content.content.clone());
            self.pushed.lock().push((name.to_string(), content.clone()));
            Ok(())
        }

        async fn fetch(&self, _name: &str) -> Result<Option<String>, StoreError> {
            Ok(self.stored.lock().clone())
        }
    }

    struct Fixture {
        cache: Arc<CountingCache>,
        store: Arc<RecordingStore>,
        registry: Arc<DocumentRegistry>,
    }

    fn fixture() -> Fixture {
        let config = ServerConfig {
            save_debounce: Duration::from_millis(100),
            save_max_debounce: Duration::from_millis(1000),
            gc_delay: Duration::from_millis(500),
            ..ServerConfig::default()
        };
        let cache = Arc::new(CountingCache::default());
        let store = Arc::new(RecordingStore::default());
        let scheduler = PersistenceScheduler::new(&config, cache.clone(), store.clone());
        let registry = DocumentRegistry::new(&config, Arc::new(scheduler));
        Fixture {
            cache,
            store,
            registry,
        }
    }

    fn append_frame(doc: &Doc, chunk: &str) -> Vec<u8> {
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.len(&txn);
            text.insert(&mut txn, len, chunk);
        }
        protocol::encode_update(&doc.transact().encode_state_as_update_v1(&before))
    }

    async fn cached(cache: &CountingCache, name: &str) -> Option<CachedDocument> {
        cache
            .get(&document_key(name))
            .await
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    #[test]
    fn test_cached_document_wire_format() {
        let raw = r#"{"content":"hi","xmlContent":"<p>hi</p>","updatedAt":"2024-05-01T10:00:00Z"}"#;
        let parsed = CachedDocument::parse("collab:doc:x", raw).unwrap();
        assert_eq!(parsed.content, "hi");
        assert_eq!(parsed.xml_content, "<p>hi</p>");
        assert!(CachedDocument::parse("collab:doc:x", "not json").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_edits_is_one_cache_write() {
        let f = fixture();
        let a = f.registry.attach("doc").await.unwrap();
        let client = Doc::new();
        for i in 0..10 {
            a.document
                .receive(a.connection_id, &append_frame(&client, &i.to_string()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(f.cache.writes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.cache.writes.load(Ordering::SeqCst), 1);
        assert_eq!(cached(&f.cache, "doc").await.unwrap().content, "0123456789");
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_edits_still_save_by_max_debounce() {
        let f = fixture();
        let a = f.registry.attach("doc").await.unwrap();
        let client = Doc::new();
        for _ in 0..30 {
            a.document
                .receive(a.connection_id, &append_frame(&client, "x"))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        // 1.5s of edits every 50ms: the 100ms debounce never goes quiet
        assert!(f.cache.writes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_document_reaches_durable_store_once() {
        let f = fixture();
        let a = f.registry.attach("doc-1").await.unwrap();
        let client = Doc::new();
        a.document
            .receive(a.connection_id, &append_frame(&client, "hello world"))
            .await
            .unwrap();
        f.registry.detach(&a.document, a.connection_id).await;

        // Drain flushed to the cache immediately
        assert_eq!(cached(&f.cache, "doc-1").await.unwrap().content, "hello world");

        tokio::time::sleep(Duration::from_secs(2)).await;
        let pushed = f.store.pushed.lock().clone();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, "doc-1");
        assert_eq!(pushed[0].1.content, "hello world");
        assert!(cached(&f.cache, "doc-1").await.is_none());
        assert!(f.registry.get("doc-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_durable_failure_keeps_cache_and_reseeds() {
        let f = fixture();
        f.store.fail.store(true, Ordering::SeqCst);
        let a = f.registry.attach("doc").await.unwrap();
        let client = Doc::new();
        a.document
            .receive(a.connection_id, &append_frame(&client, "survives"))
            .await
            .unwrap();
        f.registry.detach(&a.document, a.connection_id).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(f.registry.get("doc").await.is_none());
        assert!(f.store.pushed.lock().is_empty());
        assert_eq!(cached(&f.cache, "doc").await.unwrap().content, "survives");

        // Next lifetime is seeded from the cache and retries the push
        f.store.fail.store(false, Ordering::SeqCst);
        let b = f.registry.attach("doc").await.unwrap();
        assert_eq!(b.document.lock().await.engine.snapshot_text(), "survives");
        f.registry.detach(&b.document, b.connection_id).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.store.pushed.lock().len(), 1);
    }

    fn pushed_contents(store: &RecordingStore) -> Vec<String> {
        store
            .pushed
            .lock()
            .iter()
            .map(|(_, body)| body.content.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_durable_push_is_not_lost() {
        let f = fixture();
        f.store.gated.store(true, Ordering::SeqCst);
        let client = Doc::new();

        let a = f.registry.attach("doc").await.unwrap();
        a.document
            .receive(a.connection_id, &append_frame(&client, "one"))
            .await
            .unwrap();
        f.registry.detach(&a.document, a.connection_id).await;

        // GC fired and the push of "one" is in flight
        f.store.entered.notified().await;
        let b = f.registry.attach("doc").await.unwrap();
        assert!(Arc::ptr_eq(&a.document, &b.document));
        b.document
            .receive(b.connection_id, &append_frame(&client, " two"))
            .await
            .unwrap();

        f.store.gated.store(false, Ordering::SeqCst);
        f.store.release.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Reattached during eviction: kept in memory
        assert!(f.registry.get("doc").await.is_some());
        assert!(b.document.is_unsynced());

        f.registry.detach(&b.document, b.connection_id).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(f.registry.get("doc").await.is_none());
        assert_eq!(pushed_contents(&f.store), vec!["one", "one two"]);
        let c = f.registry.attach("doc").await.unwrap();
        assert_eq!(c.document.lock().await.engine.snapshot_text(), "one two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_and_detach_during_push_reschedules_eviction() {
        let f = fixture();
        f.store.gated.store(true, Ordering::SeqCst);
        let client = Doc::new();

        let a = f.registry.attach("doc").await.unwrap();
        a.document
            .receive(a.connection_id, &append_frame(&client, "one"))
            .await
            .unwrap();
        f.registry.detach(&a.document, a.connection_id).await;
        f.store.entered.notified().await;

        // A whole visit happens while "one" is being pushed
        let b = f.registry.attach("doc").await.unwrap();
        b.document
            .receive(b.connection_id, &append_frame(&client, " two"))
            .await
            .unwrap();
        f.registry.detach(&b.document, b.connection_id).await;
        assert_eq!(cached(&f.cache, "doc").await.unwrap().content, "one two");

        f.store.gated.store(false, Ordering::SeqCst);
        f.store.release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The newer cache entry survives and the document is not dropped yet
        assert!(f.registry.get("doc").await.is_some());
        assert_eq!(cached(&f.cache, "doc").await.unwrap().content, "one two");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.registry.get("doc").await.is_none());
        assert_eq!(pushed_contents(&f.store), vec!["one", "one two"]);
        assert!(cached(&f.cache, "doc").await.is_none());
    }

    #[tokio::test]
    async fn test_seed_falls_back_to_durable_store() {
        let f = fixture();
        *f.store.stored.lock() = Some("from the archive".to_string());
        let a = f.registry.attach("doc").await.unwrap();
        assert_eq!(a.document.lock().await.engine.snapshot_text(), "from the archive");
        assert!(!a.document.is_unsynced());
    }

    #[tokio::test]
    async fn test_unedited_document_is_not_pushed() {
        let f = fixture();
        let a = f.registry.attach("viewer").await.unwrap();
        f.registry.detach(&a.document, a.connection_id).await;
        f.registry.shutdown().await;
        assert_eq!(f.cache.writes.load(Ordering::SeqCst), 0);
        assert!(f.store.pushed.lock().is_empty());
    }
}
