//! Hash association index: exact digest → (perceptual fingerprint, MIME).
//!
//! Append-only. Lets the duplicate detector go from "found a similar-looking
//! image" back to "which exact digests does that correspond to" without
//! rehashing anything. Fingerprints are bucketed by their MIME top-level
//! family so a JPEG and a TIFF export of the same photo still compare, while
//! images never compare against video thumbnails of the same name.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use mediasync_common::{ContentDigest, HashAssociation, MediaSyncError, PerceptualHash};

/// `"image/jpeg"` → `"image"`. Unknown strings are their own family.
pub fn mime_family(mime: &str) -> &str {
    mime.split('/').next().unwrap_or(mime)
}

#[derive(Default)]
struct IndexInner {
    by_digest: HashMap<ContentDigest, (PerceptualHash, String)>,
    by_fingerprint: HashMap<(PerceptualHash, String), BTreeSet<ContentDigest>>,
}

#[derive(Default)]
pub struct HashAssociationIndex {
    inner: RwLock<IndexInner>,
}

impl HashAssociationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an association. Re-associating a digest with the same
    /// fingerprint is a no-op; a *different* fingerprint for a known digest
    /// indicates a hashing bug and is rejected as a data-integrity error.
    pub fn associate(&self, assoc: HashAssociation) -> Result<(), MediaSyncError> {
        let mut inner = self.inner.write().unwrap();
        if let Some((existing, _)) = inner.by_digest.get(&assoc.digest) {
            if *existing != assoc.fingerprint {
                return Err(MediaSyncError::HashCollision {
                    digest: assoc.digest,
                    existing: *existing,
                    incoming: assoc.fingerprint,
                });
            }
            return Ok(());
        }
        let family = mime_family(&assoc.mime).to_string();
        inner
            .by_fingerprint
            .entry((assoc.fingerprint, family))
            .or_default()
            .insert(assoc.digest.clone());
        inner
            .by_digest
            .insert(assoc.digest, (assoc.fingerprint, assoc.mime));
        Ok(())
    }

    pub fn fingerprint_of(&self, digest: &ContentDigest) -> Option<PerceptualHash> {
        let inner = self.inner.read().unwrap();
        inner.by_digest.get(digest).map(|(fp, _)| *fp)
    }

    /// All digests whose fingerprint lies within `threshold` of the given
    /// fingerprint, restricted to the same MIME family. Nearest first.
    pub fn digests_within(
        &self,
        fingerprint: PerceptualHash,
        mime: &str,
        threshold: f64,
    ) -> Vec<ContentDigest> {
        let family = mime_family(mime);
        let inner = self.inner.read().unwrap();
        let mut matches: Vec<(f64, &BTreeSet<ContentDigest>)> = inner
            .by_fingerprint
            .iter()
            .filter(|((_, f), _)| f == family)
            .filter_map(|((fp, _), digests)| {
                let score = fingerprint.similarity(*fp);
                (score <= threshold).then_some((score, digests))
            })
            .collect();
        matches.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        matches
            .into_iter()
            .flat_map(|(_, digests)| digests.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
