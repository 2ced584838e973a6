//! Duplicate detection.
//!
//! Three checks, in order: exact digest against the whole catalog, then
//! perceptual-fingerprint neighborhood via the hash association index, then
//! the publication target itself. The target check always runs — an item can
//! be locally unknown yet already published through a different harvesting
//! path, and an already-published name is the stronger answer.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use mediasync_catalog::{CatalogStore, HashAssociationIndex};
use mediasync_common::{ContentDigest, MediaId, PerceptualHash};

use crate::traits::Publisher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Nothing like this content is known locally or at the target.
    None,
    /// The content already belongs to a different catalog entry.
    Local(MediaId),
    /// The target already accepted this exact content under this name.
    Published(String),
}

pub struct DuplicateDetector {
    catalog: Arc<dyn CatalogStore>,
    index: Arc<HashAssociationIndex>,
    publisher: Arc<dyn Publisher>,
}

impl DuplicateDetector {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        index: Arc<HashAssociationIndex>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            catalog,
            index,
            publisher,
        }
    }

    /// Classify freshly hashed content. `exclude` is the id being
    /// reconciled — its own previously catalogued variants are not
    /// duplicates of themselves. `threshold` is the per-source similarity
    /// bound T; exact-digest matches win regardless of T.
    pub async fn classify(
        &self,
        digest: &ContentDigest,
        fingerprint: Option<PerceptualHash>,
        mime: &str,
        exclude: &MediaId,
        threshold: f64,
    ) -> Result<Classification> {
        // (a) exact digest across all namespaces.
        let mut local = match self.catalog.find_by_digest(digest).await? {
            Some((owner, _)) if owner != *exclude => Some(owner),
            _ => None,
        };

        // (b) fingerprint neighborhood, only consulted when (a) came up
        // empty. Candidates are verified against the catalog — the index is
        // append-only and may remember digests from since-reset namespaces.
        if local.is_none() {
            if let Some(fp) = fingerprint {
                for candidate in self.index.digests_within(fp, mime, threshold) {
                    if candidate == *digest {
                        continue;
                    }
                    match self.catalog.find_by_digest(&candidate).await? {
                        Some((owner, _)) if owner != *exclude => {
                            debug!(digest = %digest, near = %candidate, owner = %owner, "Perceptual match");
                            local = Some(owner);
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        // (c) always ask the target, even when (a)/(b) matched.
        if let Some(name) = self.publisher.is_already_published(digest).await? {
            return Ok(Classification::Published(name));
        }

        Ok(match local {
            Some(owner) => Classification::Local(owner),
            None => Classification::None,
        })
    }
}
