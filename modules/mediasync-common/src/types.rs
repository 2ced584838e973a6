use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Identity ---

/// Composite identity of one catalog entry: `namespace:local_id`.
///
/// The namespace is fixed per source adapter; the local id comes from a
/// stable source-side identifier, never from mutable fields like titles.
/// Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MediaId {
    pub namespace: String,
    pub local_id: String,
}

impl MediaId {
    pub fn new(namespace: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local_id: local_id.into(),
        }
    }
}

impl std::fmt::Display for MediaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.local_id)
    }
}

// --- Hashes ---

/// Exact content digest: lowercase hex SHA-256 of the file bytes.
/// Pure function of bytes; set once per URL, never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentDigest(pub String);

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-bit DCT perceptual hash of a decoded raster image.
/// Absent for video/audio/document content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Hamming distance in bits.
    pub fn distance(self, other: PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Normalized distance in [0,1]. 0 means perceptually identical;
    /// symmetric by construction.
    pub fn similarity(self, other: PerceptualHash) -> f64 {
        f64::from(self.distance(other)) / 64.0
    }
}

impl std::fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Append-only association: one exact digest maps to exactly one
/// (fingerprint, mime) pair. A conflicting re-association is a
/// data-integrity error, not a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashAssociation {
    pub digest: ContentDigest,
    pub fingerprint: PerceptualHash,
    pub mime: String,
}

// --- Catalog records ---

/// One retrievable file belonging to a media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileVariant {
    /// Origin URL. Unique across the whole catalog.
    pub url: String,
    /// Set once the content has been fetched and hashed; immutable thereafter.
    pub digest: Option<ContentDigest>,
    /// Present only when the decoded content is a still raster image.
    pub fingerprint: Option<PerceptualHash>,
    pub byte_size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mime: String,
    pub file_name: Option<String>,
    /// Names under which this file has been accepted by the publication
    /// target. Non-empty means this variant is never re-submitted.
    pub published_names: BTreeSet<String>,
    /// Set when this variant's content already belongs to a different
    /// catalog entry. Such variants are never candidates for publication.
    pub duplicate_of: Option<MediaId>,
}

impl FileVariant {
    pub fn new(url: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            digest: None,
            fingerprint: None,
            byte_size: None,
            width: None,
            height: None,
            mime: mime.into(),
            file_name: None,
            published_names: BTreeSet::new(),
            duplicate_of: None,
        }
    }

    /// A variant is publishable only if it has hashed content, no published
    /// name yet, and does not reference someone else's content.
    pub fn publishable(&self) -> bool {
        self.digest.is_some() && self.published_names.is_empty() && self.duplicate_of.is_none()
    }
}

/// One catalog entry.
///
/// Created on first harvest of a given MediaId, merged on every subsequent
/// harvest (source wins for metadata, local state is preserved), never
/// physically deleted except by administrative namespace reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: MediaId,
    pub title: String,
    pub description: Option<String>,
    pub credit: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Free-text keywords. Optional capability — not all source kinds carry it.
    pub keywords: Option<BTreeSet<String>>,
    /// Tri-state: None = not evaluated, Some(false) = active,
    /// Some(true) = permanently excluded.
    pub ignored: Option<bool>,
    pub ignored_reason: Option<String>,
    pub variants: Vec<FileVariant>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl MediaRecord {
    pub fn new(id: MediaId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            description: None,
            credit: None,
            published_at: None,
            keywords: None,
            ignored: None,
            ignored_reason: None,
            variants: Vec::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored == Some(true)
    }

    pub fn variant_by_url(&self, url: &str) -> Option<&FileVariant> {
        self.variants.iter().find(|v| v.url == url)
    }

    pub fn variant_by_url_mut(&mut self, url: &str) -> Option<&mut FileVariant> {
        self.variants.iter_mut().find(|v| v.url == url)
    }

    /// Merge a re-harvested record into this one. The source is authoritative
    /// for title, description, credit, keywords, and publication timestamp.
    /// Locally-owned state — the ignored flag, recorded digests, published
    /// names, and duplicate references — is preserved untouched.
    pub fn merge_from(&mut self, incoming: &MediaRecord, now: DateTime<Utc>) {
        self.title = incoming.title.clone();
        self.description = incoming.description.clone();
        self.credit = incoming.credit.clone();
        self.published_at = incoming.published_at;
        self.keywords = incoming.keywords.clone();
        self.last_seen = now;

        for file in &incoming.variants {
            match self.variant_by_url_mut(&file.url) {
                Some(existing) => {
                    existing.mime = file.mime.clone();
                    existing.file_name = file.file_name.clone();
                    if existing.byte_size.is_none() {
                        existing.byte_size = file.byte_size;
                    }
                    if existing.width.is_none() {
                        existing.width = file.width;
                    }
                    if existing.height.is_none() {
                        existing.height = file.height;
                    }
                    match (&existing.digest, &file.digest) {
                        // First time this URL's content has been hashed; the
                        // hashing pass may also have classified it.
                        (None, Some(_)) => {
                            existing.digest = file.digest.clone();
                            existing.fingerprint = file.fingerprint;
                            existing
                                .published_names
                                .extend(file.published_names.iter().cloned());
                            if existing.duplicate_of.is_none() {
                                existing.duplicate_of = file.duplicate_of.clone();
                            }
                        }
                        // Content at a stable URL is assumed immutable. A
                        // changed digest is recorded as a new variant, the
                        // original row keeps its digest.
                        (Some(old), Some(new)) if old != new => {
                            let mut extra = file.clone();
                            extra.published_names = BTreeSet::new();
                            extra.duplicate_of = None;
                            self.variants.push(extra);
                        }
                        _ => {}
                    }
                }
                None => self.variants.push(file.clone()),
            }
        }
    }
}

// --- Harvest input ---

/// A raw candidate record as produced by a source adapter, before identity
/// resolution and hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    /// The source's stable identifier for this item, when one exists.
    pub stable_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub credit: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub keywords: Option<BTreeSet<String>>,
    pub files: Vec<RawFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFile {
    pub url: String,
    pub mime: String,
    pub file_name: Option<String>,
}

/// One page of candidates from a source adapter.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub candidates: Vec<RawCandidate>,
    /// None means the source is exhausted for this cycle.
    pub next_cursor: Option<String>,
}

// --- Failure bookkeeping ---

/// A recorded, non-fatal per-item failure. Keyed by (namespace, url) —
/// re-reporting replaces the previous message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: Uuid,
    pub namespace: String,
    pub url: String,
    pub message: String,
    pub reported_at: DateTime<Utc>,
}
