use thiserror::Error;

use crate::types::{ContentDigest, PerceptualHash};

#[derive(Error, Debug)]
pub enum MediaSyncError {
    #[error("Fetch error for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Decode error for {url}: {message}")]
    Decode { url: String, message: String },

    #[error("No stable identifier for candidate \"{title}\" from {namespace}")]
    IdentityDerivation { namespace: String, title: String },

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Store error: {0}")]
    Store(String),

    /// Same digest mapped to two different fingerprints. Indicates a hashing
    /// bug, not a transient fault — surfaced distinctly from ordinary
    /// problems.
    #[error("Hash integrity violation: digest {digest} already associated with {existing}, refusing {incoming}")]
    HashCollision {
        digest: ContentDigest,
        existing: PerceptualHash,
        incoming: PerceptualHash,
    },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
