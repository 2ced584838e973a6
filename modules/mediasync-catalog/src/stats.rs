//! Read-only query surface for reporting and UI collaborators.
//!
//! Every aggregate is answered through the invalidation-backed cache: a
//! cache miss recomputes from the catalog, a catalog mutation invalidates
//! the affected scope before the mutating call returns.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mediasync_common::MediaId;

use crate::cache::AggregateCache;
use crate::hash_index::mime_family;
use crate::store::CatalogStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateEntry {
    pub id: MediaId,
    pub url: String,
    pub duplicate_of: MediaId,
}

pub struct CatalogStats {
    store: Arc<dyn CatalogStore>,
    cache: Arc<AggregateCache>,
}

impl CatalogStats {
    pub fn new(store: Arc<dyn CatalogStore>, cache: Arc<AggregateCache>) -> Self {
        Self { store, cache }
    }

    /// Media count, per source or global.
    pub async fn media_count(&self, namespace: Option<&str>) -> Result<u64> {
        let value = self
            .cache
            .get_or_compute("media_count", namespace, || async {
                Ok(json!(self.store.count(namespace).await?))
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Items with at least one variant still eligible for publication.
    pub async fn unpublished_count(&self, namespace: Option<&str>) -> Result<u64> {
        let value = self
            .cache
            .get_or_compute("unpublished_count", namespace, || async {
                let records = self.store.records(namespace).await?;
                let count = records
                    .iter()
                    .filter(|r| !r.is_ignored())
                    .filter(|r| r.variants.iter().any(|v| v.publishable()))
                    .count() as u64;
                Ok(json!(count))
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Ids of items with a hashed raster-image variant that has no
    /// perceptual fingerprint yet.
    pub async fn missing_fingerprint(&self, namespace: Option<&str>) -> Result<Vec<MediaId>> {
        let value = self
            .cache
            .get_or_compute("missing_fingerprint", namespace, || async {
                let records = self.store.records(namespace).await?;
                let mut ids: Vec<MediaId> = records
                    .iter()
                    .filter(|r| {
                        r.variants.iter().any(|v| {
                            v.digest.is_some()
                                && v.fingerprint.is_none()
                                && mime_family(&v.mime) == "image"
                        })
                    })
                    .map(|r| r.id.clone())
                    .collect();
                ids.sort();
                Ok(serde_json::to_value(ids)?)
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Variants recorded as duplicate references to another record.
    pub async fn local_duplicates(&self, namespace: Option<&str>) -> Result<Vec<DuplicateEntry>> {
        let value = self
            .cache
            .get_or_compute("local_duplicates", namespace, || async {
                let records = self.store.records(namespace).await?;
                let mut entries: Vec<DuplicateEntry> = records
                    .iter()
                    .flat_map(|r| {
                        r.variants.iter().filter_map(|v| {
                            v.duplicate_of.as_ref().map(|of| DuplicateEntry {
                                id: r.id.clone(),
                                url: v.url.clone(),
                                duplicate_of: of.clone(),
                            })
                        })
                    })
                    .collect();
                entries.sort_by(|a, b| (&a.id, &a.url).cmp(&(&b.id, &b.url)));
                Ok(serde_json::to_value(entries)?)
            })
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}
