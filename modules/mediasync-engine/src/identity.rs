//! Composite identity resolution.
//!
//! The namespace is fixed per adapter instance; the local id must come from
//! a stable source-side identifier. Titles, descriptions, and other mutable
//! fields are never part of identity — a retitled item is still the same
//! item.

use mediasync_common::{MediaId, MediaSyncError, RawCandidate};

/// Derive the composite id for a candidate. Pure and deterministic: the same
/// input always yields the same id. A candidate without a usable stable
/// identifier is rejected (the engine records it as a problem and moves on).
pub fn resolve_identity(
    namespace: &str,
    candidate: &RawCandidate,
) -> Result<MediaId, MediaSyncError> {
    match candidate
        .stable_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        Some(local_id) => Ok(MediaId::new(namespace, local_id)),
        None => Err(MediaSyncError::IdentityDerivation {
            namespace: namespace.to_string(),
            title: candidate.title.clone(),
        }),
    }
}

/// Normalize an origin URL before it becomes a catalog key: strip tracking
/// parameters and fragments so the same file fetched through decorated links
/// dedupes to one variant.
pub fn normalize_url(url: &str) -> String {
    const TRACKING_PARAMS: &[&str] = &[
        "fbclid", "gclid", "utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content",
        "ref", "mc_cid", "mc_eid",
    ];

    let Ok(mut parsed) = url::Url::parse(url) else {
        return url.to_string();
    };

    parsed.set_fragment(None);
    if parsed.query().is_none() {
        return parsed.to_string();
    }

    let clean_pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if clean_pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(clean_pairs);
    }

    parsed.to_string()
}
