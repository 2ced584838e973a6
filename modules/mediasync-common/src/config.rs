use std::collections::HashMap;
use std::env;

/// Application configuration loaded from environment variables.
///
/// All values have defaults; the defaults are starting points, not tuned
/// constants. Agencies differ in how aggressively they re-encode images, so
/// the similarity threshold can be overridden per source namespace.
#[derive(Debug, Clone)]
pub struct Config {
    /// Perceptual similarity threshold T in [0,1]. Fingerprint matches with
    /// `similarity <= T` are treated as duplicates. Exact-digest matches win
    /// regardless of T.
    pub similarity_threshold: f64,
    /// Per-namespace overrides of the similarity threshold.
    pub source_thresholds: HashMap<String, f64>,
    /// Bounded retries for publish submission failures.
    pub publish_max_retries: u32,
    /// Base backoff between publish retries; doubles per attempt.
    pub publish_backoff_ms: u64,
    /// Worker pool size: how many source harvest jobs run concurrently.
    pub max_concurrent_sources: usize,
    /// Fan-out for hashing variants of a single item.
    pub hash_fanout: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.25,
            source_thresholds: HashMap::new(),
            publish_max_retries: 3,
            publish_backoff_ms: 500,
            max_concurrent_sources: 4,
            hash_fanout: 4,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults. Panics with a clear message on malformed numeric values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            similarity_threshold: env_parsed(
                "MEDIASYNC_SIMILARITY_THRESHOLD",
                defaults.similarity_threshold,
            ),
            source_thresholds: env::var("MEDIASYNC_SOURCE_THRESHOLDS")
                .map(|v| parse_source_thresholds(&v))
                .unwrap_or_default(),
            publish_max_retries: env_parsed(
                "MEDIASYNC_PUBLISH_MAX_RETRIES",
                defaults.publish_max_retries,
            ),
            publish_backoff_ms: env_parsed(
                "MEDIASYNC_PUBLISH_BACKOFF_MS",
                defaults.publish_backoff_ms,
            ),
            max_concurrent_sources: env_parsed(
                "MEDIASYNC_MAX_CONCURRENT_SOURCES",
                defaults.max_concurrent_sources,
            ),
            hash_fanout: env_parsed("MEDIASYNC_HASH_FANOUT", defaults.hash_fanout),
        }
    }

    /// The similarity threshold to apply for a given source namespace.
    pub fn threshold_for(&self, namespace: &str) -> f64 {
        self.source_thresholds
            .get(namespace)
            .copied()
            .unwrap_or(self.similarity_threshold)
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid number, got \"{v}\"")),
        Err(_) => default,
    }
}

/// Parse `"nasa=0.1,flickr=0.3"` into a namespace → threshold map.
/// Malformed entries are skipped.
fn parse_source_thresholds(raw: &str) -> HashMap<String, f64> {
    raw.split(',')
        .filter_map(|pair| {
            let (ns, value) = pair.split_once('=')?;
            let threshold: f64 = value.trim().parse().ok()?;
            Some((ns.trim().to_string(), threshold))
        })
        .collect()
}
