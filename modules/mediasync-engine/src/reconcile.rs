//! The reconciliation engine: one candidate item through
//! fetch → hash → duplicate check → catalog upsert → (optionally) publish.
//!
//! Per item the state machine is
//! `FETCHED → HASHED → {NEW | CATALOG_MATCH | LOCAL_DUPLICATE |
//! PUBLISHED_DUPLICATE | IGNORED} → UPSERTED → (opt) PUBLISHED → DONE`,
//! with ERROR reachable from any step. Failures of one file variant never
//! abort its siblings, and failures of one item never abort the batch.
//!
//! The engine is the sole writer to the catalog store and the hash
//! association index. Exactly one reconciliation is in flight per composite
//! id — the per-id guard is taken before the first catalog read and held to
//! the end of the item, without pinning any store-wide lock across fetch,
//! decode, or publish suspension points.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use mediasync_catalog::{CatalogStore, HashAssociationIndex, ProblemTracker};
use mediasync_common::{
    Config, ContentDigest, FileVariant, HashAssociation, MediaId, MediaRecord, MediaSyncError,
    PerceptualHash, RawCandidate,
};

use crate::dedup::{Classification, DuplicateDetector};
use crate::hasher;
use crate::identity::{normalize_url, resolve_identity};
use crate::traits::{MediaDecoder, Publisher, SourceAdapter};

/// States of the per-item reconciliation machine. Used for tracing; the
/// terminal classification is reported as [`ReconcileOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Fetched,
    Hashed,
    New,
    CatalogMatch,
    LocalDuplicate,
    PublishedDuplicate,
    Ignored,
    Upserted,
    Published,
    Done,
    Error,
}

/// Terminal classification of one reconciled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    New,
    CatalogMatch,
    LocalDuplicate,
    PublishedDuplicate,
    Ignored,
    Failed,
}

/// Counters for one reconciliation run.
#[derive(Debug, Default, Clone)]
pub struct ReconcileStats {
    pub items: u32,
    pub items_new: u32,
    pub items_matched: u32,
    pub items_local_duplicate: u32,
    pub items_published_duplicate: u32,
    pub items_ignored: u32,
    pub items_failed: u32,
    pub files_hashed: u32,
    pub file_errors: u32,
    pub integrity_errors: u32,
    pub published: u32,
    pub publish_failures: u32,
}

impl ReconcileStats {
    pub fn merge(&mut self, other: &ReconcileStats) {
        self.items += other.items;
        self.items_new += other.items_new;
        self.items_matched += other.items_matched;
        self.items_local_duplicate += other.items_local_duplicate;
        self.items_published_duplicate += other.items_published_duplicate;
        self.items_ignored += other.items_ignored;
        self.items_failed += other.items_failed;
        self.files_hashed += other.files_hashed;
        self.file_errors += other.file_errors;
        self.integrity_errors += other.integrity_errors;
        self.published += other.published;
        self.publish_failures += other.publish_failures;
    }

    fn record(&mut self, outcome: ReconcileOutcome) {
        self.items += 1;
        match outcome {
            ReconcileOutcome::New => self.items_new += 1,
            ReconcileOutcome::CatalogMatch => self.items_matched += 1,
            ReconcileOutcome::LocalDuplicate => self.items_local_duplicate += 1,
            ReconcileOutcome::PublishedDuplicate => self.items_published_duplicate += 1,
            ReconcileOutcome::Ignored => self.items_ignored += 1,
            ReconcileOutcome::Failed => self.items_failed += 1,
        }
    }
}

impl std::fmt::Display for ReconcileStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Items reconciled:     {}", self.items)?;
        writeln!(f, "  new:                {}", self.items_new)?;
        writeln!(f, "  catalog match:      {}", self.items_matched)?;
        writeln!(f, "  local duplicate:    {}", self.items_local_duplicate)?;
        writeln!(f, "  published duplicate:{}", self.items_published_duplicate)?;
        writeln!(f, "  ignored:            {}", self.items_ignored)?;
        writeln!(f, "  failed:             {}", self.items_failed)?;
        writeln!(f, "Files hashed:         {}", self.files_hashed)?;
        writeln!(f, "File errors:          {}", self.file_errors)?;
        writeln!(f, "Integrity errors:     {}", self.integrity_errors)?;
        writeln!(f, "Published:            {}", self.published)?;
        write!(f, "Publish failures:     {}", self.publish_failures)
    }
}

/// One successfully hashed file, bytes kept around for a possible submit.
struct HashedFile {
    url: String,
    digest: ContentDigest,
    fingerprint: Option<PerceptualHash>,
    byte_size: u64,
    width: Option<u32>,
    height: Option<u32>,
    bytes: Vec<u8>,
}

pub struct Reconciler {
    catalog: Arc<dyn CatalogStore>,
    index: Arc<HashAssociationIndex>,
    problems: Arc<ProblemTracker>,
    detector: DuplicateDetector,
    decoder: Arc<dyn MediaDecoder>,
    publisher: Arc<dyn Publisher>,
    config: Config,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        index: Arc<HashAssociationIndex>,
        problems: Arc<ProblemTracker>,
        decoder: Arc<dyn MediaDecoder>,
        publisher: Arc<dyn Publisher>,
        config: Config,
    ) -> Self {
        let detector = DuplicateDetector::new(
            Arc::clone(&catalog),
            Arc::clone(&index),
            Arc::clone(&publisher),
        );
        Self {
            catalog,
            index,
            problems,
            detector,
            decoder,
            publisher,
            config,
        }
    }

    /// Reconcile one candidate. Recoverable failures are recorded as
    /// problems and reflected in the outcome; an `Err` from here is a store
    /// failure the caller may still survive by moving to the next item.
    pub async fn reconcile(
        &self,
        adapter: &dyn SourceAdapter,
        candidate: &RawCandidate,
        stats: &mut ReconcileStats,
    ) -> Result<ReconcileOutcome> {
        let namespace = adapter.namespace();

        let id = match resolve_identity(namespace, candidate) {
            Ok(id) => id,
            Err(e) => {
                let url = candidate
                    .files
                    .first()
                    .map(|f| f.url.as_str())
                    .unwrap_or(candidate.title.as_str());
                self.problems.report(namespace, url, e.to_string());
                stats.record(ReconcileOutcome::Failed);
                return Ok(ReconcileOutcome::Failed);
            }
        };

        // Single-writer discipline for this composite id.
        let _guard = self.catalog.lock_entry(&id).await;
        let mut state = ReconcileState::Fetched;
        debug!(media = %id, ?state, "Reconciliation started");

        let existing = self.catalog.get(&id).await?;
        let mut incoming = build_record(&id, candidate);

        // A previously ignored item skips everything except the metadata
        // merge.
        if existing.as_ref().is_some_and(|r| r.is_ignored()) {
            self.catalog.upsert(incoming).await?;
            debug!(media = %id, "Ignored item, metadata merged only");
            stats.record(ReconcileOutcome::Ignored);
            return Ok(ReconcileOutcome::Ignored);
        }

        // FETCHED → HASHED. URLs whose digest the catalog already carries
        // are not refetched: a digest is a pure function of bytes at a
        // stable URL and is computed exactly once.
        let to_hash: Vec<(String, String)> = incoming
            .variants
            .iter()
            .filter(|v| {
                existing
                    .as_ref()
                    .and_then(|r| r.variant_by_url(&v.url))
                    .and_then(|v| v.digest.as_ref())
                    .is_none()
            })
            .map(|v| (v.url.clone(), v.mime.clone()))
            .collect();

        let results: Vec<Result<HashedFile, (String, MediaSyncError)>> =
            stream::iter(to_hash.into_iter().map(|(url, mime)| async move {
                self.hash_one(adapter, &url, &mime).await
            }))
            .buffer_unordered(self.config.hash_fanout.max(1))
            .collect()
            .await;

        let mut bytes_by_url: HashMap<String, Vec<u8>> = HashMap::new();
        let mut newly_hashed: Vec<String> = Vec::new();
        for result in results {
            match result {
                Ok(hashed) => {
                    stats.files_hashed += 1;
                    if let Some(variant) = incoming.variant_by_url_mut(&hashed.url) {
                        variant.digest = Some(hashed.digest);
                        variant.fingerprint = hashed.fingerprint;
                        variant.byte_size = Some(hashed.byte_size);
                        variant.width = hashed.width;
                        variant.height = hashed.height;
                    }
                    newly_hashed.push(hashed.url.clone());
                    bytes_by_url.insert(hashed.url, hashed.bytes);
                }
                // ERROR for this one variant only; siblings continue.
                Err((url, error)) => {
                    self.problems.report(namespace, &url, error.to_string());
                    stats.file_errors += 1;
                }
            }
        }
        state = ReconcileState::Hashed;
        debug!(media = %id, ?state, hashed = newly_hashed.len(), "Hashing complete");

        // Record hash associations. A digest that maps to two different
        // fingerprints is a hashing bug, fatal for this record.
        for url in &newly_hashed {
            let Some(variant) = incoming.variant_by_url(url) else {
                continue;
            };
            let (Some(digest), Some(fingerprint)) = (&variant.digest, variant.fingerprint) else {
                continue;
            };
            if let Err(e) = self.index.associate(HashAssociation {
                digest: digest.clone(),
                fingerprint,
                mime: variant.mime.clone(),
            }) {
                if let MediaSyncError::HashCollision { .. } = e {
                    error!(media = %id, url = %url, error = %e, "Hash integrity violation");
                    stats.integrity_errors += 1;
                    stats.record(ReconcileOutcome::Failed);
                    return Ok(ReconcileOutcome::Failed);
                }
                return Err(e.into());
            }
        }

        // Classify newly hashed content against the catalog and the target.
        let threshold = self.config.threshold_for(namespace);
        let mut any_local = false;
        let mut any_published = false;
        for url in &newly_hashed {
            let Some(variant) = incoming.variant_by_url(url) else {
                continue;
            };
            let Some(digest) = variant.digest.clone() else {
                continue;
            };
            let classification = self
                .detector
                .classify(&digest, variant.fingerprint, &variant.mime, &id, threshold)
                .await?;
            let Some(variant) = incoming.variant_by_url_mut(url) else {
                continue;
            };
            match classification {
                Classification::Published(name) => {
                    info!(media = %id, url = %url, name = %name, "Already published at target");
                    variant.published_names.insert(name);
                    any_published = true;
                }
                Classification::Local(owner) => {
                    info!(media = %id, url = %url, owner = %owner, "Local duplicate");
                    variant.duplicate_of = Some(owner);
                    any_local = true;
                }
                Classification::None => {}
            }
        }

        let outcome = if existing.is_some() {
            ReconcileOutcome::CatalogMatch
        } else if any_published {
            ReconcileOutcome::PublishedDuplicate
        } else if any_local {
            ReconcileOutcome::LocalDuplicate
        } else {
            ReconcileOutcome::New
        };
        state = match outcome {
            ReconcileOutcome::New => ReconcileState::New,
            ReconcileOutcome::CatalogMatch => ReconcileState::CatalogMatch,
            ReconcileOutcome::LocalDuplicate => ReconcileState::LocalDuplicate,
            ReconcileOutcome::PublishedDuplicate => ReconcileState::PublishedDuplicate,
            ReconcileOutcome::Ignored | ReconcileOutcome::Failed => ReconcileState::Error,
        };
        debug!(media = %id, ?state, "Classified");

        // Merge semantics live in the store's upsert.
        let stored = self.catalog.upsert(incoming).await?;
        state = ReconcileState::Upserted;
        debug!(media = %id, ?state, "Upserted");

        // Submit only content that resolved NEW, either this cycle or a
        // previous one whose publish attempts were exhausted. A variant
        // with a published name or a duplicate reference is never submitted.
        if matches!(
            outcome,
            ReconcileOutcome::New | ReconcileOutcome::CatalogMatch
        ) {
            let submitted = self
                .publish_variants(adapter, &stored, &bytes_by_url, stats)
                .await?;
            if submitted > 0 {
                state = ReconcileState::Published;
                debug!(media = %id, ?state, submitted, "Published");
            }
        }

        state = ReconcileState::Done;
        debug!(media = %id, ?state, ?outcome, "Reconciliation complete");
        stats.record(outcome);
        Ok(outcome)
    }

    /// Fetch, digest, and (for raster images) fingerprint one file.
    async fn hash_one(
        &self,
        adapter: &dyn SourceAdapter,
        url: &str,
        mime: &str,
    ) -> Result<HashedFile, (String, MediaSyncError)> {
        let bytes = adapter.fetch(url).await.map_err(|e| {
            let error = MediaSyncError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            };
            (url.to_string(), error)
        })?;
        let digest = hasher::digest(&bytes);

        let image = self.decoder.decode(&bytes, mime).await.map_err(|e| {
            let error = MediaSyncError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            };
            (url.to_string(), error)
        })?;

        let (fingerprint, width, height) = match image {
            Some(image) => (
                Some(hasher::fingerprint(&image)),
                Some(image.width),
                Some(image.height),
            ),
            None => (None, None, None),
        };

        Ok(HashedFile {
            url: url.to_string(),
            digest,
            fingerprint,
            byte_size: bytes.len() as u64,
            width,
            height,
            bytes,
        })
    }

    /// Submit every still-publishable variant, with bounded retries and
    /// exponential backoff. Exhaustion records a problem and leaves the
    /// variant unpublished for the next harvest cycle.
    async fn publish_variants(
        &self,
        adapter: &dyn SourceAdapter,
        record: &MediaRecord,
        bytes_by_url: &HashMap<String, Vec<u8>>,
        stats: &mut ReconcileStats,
    ) -> Result<u32> {
        let namespace = &record.id.namespace;
        let mut submitted = 0u32;

        let publishable: Vec<(usize, FileVariant)> = record
            .variants
            .iter()
            .enumerate()
            .filter(|(_, v)| v.publishable())
            .map(|(i, v)| (i, v.clone()))
            .collect();

        // One submission per distinct digest. A digest already accepted
        // under a sibling variant (this cycle or a previous one) is not
        // submitted again; the accepted name is mirrored onto the repeat
        // carrier so it stops being publishable.
        let mut accepted_by_digest: HashMap<ContentDigest, String> = record
            .variants
            .iter()
            .filter_map(|v| {
                let digest = v.digest.clone()?;
                let name = v.published_names.iter().next()?.clone();
                Some((digest, name))
            })
            .collect();

        for (index, variant) in publishable {
            let Some(digest) = variant.digest.clone() else {
                continue;
            };
            if let Some(name) = accepted_by_digest.get(&digest) {
                self.catalog
                    .mark_published(&record.id, &variant.url, name)
                    .await?;
                debug!(media = %record.id, url = %variant.url, name = %name, "Same content already accepted, name mirrored");
                continue;
            }

            let bytes = match bytes_by_url.get(&variant.url) {
                Some(bytes) => bytes.clone(),
                // Retry of an earlier cycle's failed publish: the digest is
                // known but the bytes were not fetched this time around.
                None => match adapter.fetch(&variant.url).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let error = MediaSyncError::Fetch {
                            url: variant.url.clone(),
                            message: e.to_string(),
                        };
                        self.problems
                            .report(namespace, &variant.url, error.to_string());
                        stats.file_errors += 1;
                        continue;
                    }
                },
            };

            let name = proposed_name(record, &variant, index);
            match self.submit_with_retry(&bytes, &name, record).await {
                Ok(accepted) => {
                    self.catalog
                        .mark_published(&record.id, &variant.url, &accepted)
                        .await?;
                    accepted_by_digest.insert(digest, accepted);
                    stats.published += 1;
                    submitted += 1;
                }
                Err(e) => {
                    self.problems.report(namespace, &variant.url, e.to_string());
                    stats.publish_failures += 1;
                }
            }
        }
        Ok(submitted)
    }

    async fn submit_with_retry(
        &self,
        bytes: &[u8],
        name: &str,
        record: &MediaRecord,
    ) -> Result<String> {
        let attempts = self.config.publish_max_retries.saturating_add(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(self.config.publish_backoff_ms, attempt - 1))
                    .await;
            }
            match self.publisher.submit(bytes, name, record).await {
                Ok(accepted) => return Ok(accepted),
                Err(e) => {
                    warn!(name, attempt, error = %e, "Publish attempt failed");
                    last_err = Some(e);
                }
            }
        }
        let message = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts were made".to_string());
        Err(MediaSyncError::Publish(message).into())
    }
}

/// Exponential backoff with a capped exponent so extreme retry
/// configurations cannot overflow the delay arithmetic.
fn backoff_delay(base_ms: u64, retry: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1 << retry.min(16)))
}

/// Build the incoming record from a candidate, with normalized file URLs.
/// The source is authoritative for everything on it; locally-owned state is
/// filled in by the store's merge.
fn build_record(id: &MediaId, candidate: &RawCandidate) -> MediaRecord {
    let now = chrono::Utc::now();
    let mut record = MediaRecord::new(id.clone(), candidate.title.clone(), now);
    record.description = candidate.description.clone();
    record.credit = candidate.credit.clone();
    record.published_at = candidate.published_at;
    record.keywords = candidate.keywords.clone();
    for file in &candidate.files {
        let mut variant = FileVariant::new(normalize_url(&file.url), file.mime.clone());
        variant.file_name = file.file_name.clone();
        record.variants.push(variant);
    }
    record
}

/// Name proposed to the publication target: namespace + local id, with the
/// original file name disambiguating additional variants.
fn proposed_name(record: &MediaRecord, variant: &FileVariant, index: usize) -> String {
    let base = format!("{} {}", record.id.namespace, record.id.local_id);
    if index == 0 {
        base
    } else if let Some(file_name) = &variant.file_name {
        format!("{base} ({file_name})")
    } else {
        format!("{base} ({index})")
    }
}
