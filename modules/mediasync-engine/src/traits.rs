// Trait abstractions for the reconciliation engine's collaborators.
//
// SourceAdapter — per-source network fetching and parsing, out of scope here.
// MediaDecoder — byte decoding and pixel access, out of scope here.
// Publisher — the downstream publication target's wire protocol, out of scope.
//
// These enable deterministic testing with in-memory mocks: no network, no
// target system, no fixtures on disk.

use anyhow::Result;
use async_trait::async_trait;

use mediasync_common::{Batch, ContentDigest, MediaRecord};

// ---------------------------------------------------------------------------
// SourceAdapter
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fixed namespace of this adapter instance.
    fn namespace(&self) -> &str;

    /// Pull the next page of candidate records. `next_cursor: None` on the
    /// returned batch means the source is exhausted for this cycle.
    async fn next_batch(&self, cursor: Option<&str>) -> Result<Batch>;

    /// Retrieve the raw bytes behind one file URL.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// MediaDecoder
// ---------------------------------------------------------------------------

/// Decoded pixel access for a still raster image: 8-bit luma plane,
/// row-major, `luma.len() == width * height`.
#[derive(Debug, Clone)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub luma: Vec<u8>,
}

impl RasterImage {
    pub fn luma_at(&self, x: u32, y: u32) -> u8 {
        self.luma[(y * self.width + x) as usize]
    }
}

#[async_trait]
pub trait MediaDecoder: Send + Sync {
    /// Decode content into pixel access. `Ok(None)` for non-raster content
    /// (video, audio, documents); an error only for bytes that should have
    /// decoded but did not. Must be deterministic for a given byte stream.
    async fn decode(&self, bytes: &[u8], declared_mime: &str) -> Result<Option<RasterImage>>;
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Whether a file with this exact digest is already accepted at the
    /// publication target, independent of what the local catalog knows.
    async fn is_already_published(&self, digest: &ContentDigest) -> Result<Option<String>>;

    /// Submit one file. Returns the name the target accepted it under.
    /// Fallible and slow; a failure is never assumed to have silently
    /// succeeded on the target side.
    async fn submit(
        &self,
        bytes: &[u8],
        proposed_name: &str,
        record: &MediaRecord,
    ) -> Result<String>;
}
