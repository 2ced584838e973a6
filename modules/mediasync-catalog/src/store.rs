//! The catalog store: persisted collection of media records keyed by
//! composite identity.
//!
//! The store exclusively owns record lifecycle; the reconciliation engine is
//! the only writer, readers never mutate. Every mutation invalidates the
//! aggregate cache for the affected namespace inside the same critical
//! section, so the very next read recomputes from post-mutation state.
//!
//! Persistence technology is an implementation choice; `MemoryCatalog` is
//! the canonical implementation and the trait is the seam for a
//! database-backed one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::info;

use mediasync_common::{ContentDigest, MediaId, MediaRecord, MediaSyncError};

use crate::cache::AggregateCache;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get(&self, id: &MediaId) -> Result<Option<MediaRecord>>;

    /// Insert a new record or merge into the existing one (source wins for
    /// metadata, locally-owned state is preserved). Returns the stored
    /// record after the merge.
    async fn upsert(&self, record: MediaRecord) -> Result<MediaRecord>;

    /// Whole-catalog digest lookup, regardless of namespace. Returns the
    /// owning id and the variant URL that carries the digest.
    async fn find_by_digest(&self, digest: &ContentDigest) -> Result<Option<(MediaId, String)>>;

    /// Which record, if any, already owns this origin URL.
    async fn url_known(&self, url: &str) -> Result<Option<MediaId>>;

    /// Record a name accepted by the publication target for one variant.
    async fn mark_published(&self, id: &MediaId, url: &str, name: &str) -> Result<()>;

    /// Mark one variant as a duplicate reference to another record's content.
    async fn mark_duplicate(&self, id: &MediaId, url: &str, of: &MediaId) -> Result<()>;

    async fn set_ignored(&self, id: &MediaId, ignored: bool, reason: Option<String>) -> Result<()>;

    /// All records, optionally restricted to one namespace. Read-only
    /// snapshot for the stats surface.
    async fn records(&self, namespace: Option<&str>) -> Result<Vec<MediaRecord>>;

    async fn count(&self, namespace: Option<&str>) -> Result<u64>;

    /// Administrative reset: physically delete every record in a namespace.
    async fn reset_namespace(&self, namespace: &str) -> Result<u64>;

    /// Single-writer discipline: the guard for one composite id. Exactly one
    /// in-flight reconciliation per id; the guard is owned so it can be held
    /// across fetch/decode/publish suspension points without pinning any
    /// store-wide lock.
    async fn lock_entry(&self, id: &MediaId) -> OwnedMutexGuard<()>;
}

#[derive(Default)]
struct CatalogInner {
    records: HashMap<MediaId, MediaRecord>,
    by_url: HashMap<String, MediaId>,
    by_digest: HashMap<ContentDigest, (MediaId, String)>,
}

impl CatalogInner {
    fn index_record(&mut self, record: &MediaRecord) {
        for variant in &record.variants {
            self.by_url
                .entry(variant.url.clone())
                .or_insert_with(|| record.id.clone());
            if let Some(digest) = &variant.digest {
                self.by_digest
                    .entry(digest.clone())
                    .or_insert_with(|| (record.id.clone(), variant.url.clone()));
            }
        }
    }
}

pub struct MemoryCatalog {
    inner: RwLock<CatalogInner>,
    entry_locks: StdMutex<HashMap<MediaId, Arc<Mutex<()>>>>,
    cache: Arc<AggregateCache>,
}

impl MemoryCatalog {
    pub fn new(cache: Arc<AggregateCache>) -> Self {
        Self {
            inner: RwLock::new(CatalogInner::default()),
            entry_locks: StdMutex::new(HashMap::new()),
            cache,
        }
    }

    pub fn cache(&self) -> Arc<AggregateCache> {
        Arc::clone(&self.cache)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn get(&self, id: &MediaId) -> Result<Option<MediaRecord>> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn upsert(&self, record: MediaRecord) -> Result<MediaRecord> {
        let namespace = record.id.namespace.clone();
        let mut inner = self.inner.write().await;
        let stored = match inner.records.get_mut(&record.id) {
            Some(existing) => {
                existing.merge_from(&record, Utc::now());
                existing.clone()
            }
            None => {
                inner.records.insert(record.id.clone(), record.clone());
                record
            }
        };
        inner.index_record(&stored);
        self.cache.invalidate_namespace(&namespace);
        Ok(stored)
    }

    async fn find_by_digest(&self, digest: &ContentDigest) -> Result<Option<(MediaId, String)>> {
        Ok(self.inner.read().await.by_digest.get(digest).cloned())
    }

    async fn url_known(&self, url: &str) -> Result<Option<MediaId>> {
        Ok(self.inner.read().await.by_url.get(url).cloned())
    }

    async fn mark_published(&self, id: &MediaId, url: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| MediaSyncError::Store(format!("unknown media id {id}")))?;
        let variant = record
            .variant_by_url_mut(url)
            .ok_or_else(|| MediaSyncError::Store(format!("unknown variant url {url} on {id}")))?;
        variant.published_names.insert(name.to_string());
        self.cache.invalidate_namespace(&id.namespace);
        info!(media = %id, url, name, "Recorded published name");
        Ok(())
    }

    async fn mark_duplicate(&self, id: &MediaId, url: &str, of: &MediaId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| MediaSyncError::Store(format!("unknown media id {id}")))?;
        let variant = record
            .variant_by_url_mut(url)
            .ok_or_else(|| MediaSyncError::Store(format!("unknown variant url {url} on {id}")))?;
        variant.duplicate_of = Some(of.clone());
        self.cache.invalidate_namespace(&id.namespace);
        Ok(())
    }

    async fn set_ignored(&self, id: &MediaId, ignored: bool, reason: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| MediaSyncError::Store(format!("unknown media id {id}")))?;
        record.ignored = Some(ignored);
        record.ignored_reason = reason;
        self.cache.invalidate_namespace(&id.namespace);
        Ok(())
    }

    async fn records(&self, namespace: Option<&str>) -> Result<Vec<MediaRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .filter(|r| namespace.is_none_or(|ns| r.id.namespace == ns))
            .cloned()
            .collect())
    }

    async fn count(&self, namespace: Option<&str>) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .filter(|r| namespace.is_none_or(|ns| r.id.namespace == ns))
            .count() as u64)
    }

    async fn reset_namespace(&self, namespace: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let removed: Vec<MediaId> = inner
            .records
            .keys()
            .filter(|id| id.namespace == namespace)
            .cloned()
            .collect();
        for id in &removed {
            inner.records.remove(id);
        }
        inner.by_url.retain(|_, id| id.namespace != namespace);
        inner.by_digest.retain(|_, (id, _)| id.namespace != namespace);
        // Release entry guards along with the records. A guard currently
        // held keeps its mutex alive through the guard's own Arc.
        self.entry_locks
            .lock()
            .unwrap()
            .retain(|id, lock| id.namespace != namespace || Arc::strong_count(lock) > 1);
        self.cache.invalidate_namespace(namespace);
        info!(namespace, removed = removed.len(), "Namespace reset");
        Ok(removed.len() as u64)
    }

    async fn lock_entry(&self, id: &MediaId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.entry_locks.lock().unwrap();
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
