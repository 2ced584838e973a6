//! End-to-end reconciliation tests against in-memory collaborators:
//! a scripted source adapter, a deterministic decoder, and a mock
//! publication target. No network, no fixtures on disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};

use anyhow::{bail, Result};
use async_trait::async_trait;

use mediasync_catalog::{CatalogStats, CatalogStore, HashAssociationIndex, MemoryCatalog, ProblemTracker};
use mediasync_catalog::AggregateCache;
use mediasync_common::{
    Batch, Config, ContentDigest, HashAssociation, MediaId, MediaRecord, PerceptualHash,
    RawCandidate, RawFile,
};
use mediasync_engine::hasher;
use mediasync_engine::{
    HarvestRunner, MediaDecoder, Publisher, RasterImage, ReconcileOutcome, ReconcileStats,
    Reconciler, SourceAdapter,
};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ---------------------------------------------------------------------------
// Mock source adapter
// ---------------------------------------------------------------------------

struct MockAdapter {
    namespace: String,
    pages: Vec<Vec<RawCandidate>>,
    files: HashMap<String, Vec<u8>>,
    fail_batches: bool,
    fetch_calls: AtomicU32,
}

impl MockAdapter {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            pages: Vec::new(),
            files: HashMap::new(),
            fail_batches: false,
            fetch_calls: AtomicU32::new(0),
        }
    }

    fn with_page(mut self, candidates: Vec<RawCandidate>) -> Self {
        self.pages.push(candidates);
        self
    }

    fn with_file(mut self, url: &str, bytes: &[u8]) -> Self {
        self.files.insert(url.to_string(), bytes.to_vec());
        self
    }

    fn fetches(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn next_batch(&self, cursor: Option<&str>) -> Result<Batch> {
        if self.fail_batches {
            bail!("feed endpoint returned 503");
        }
        let page: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
        let candidates = self.pages.get(page).cloned().unwrap_or_default();
        let next_cursor = (page + 1 < self.pages.len()).then(|| (page + 1).to_string());
        Ok(Batch {
            candidates,
            next_cursor,
        })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match self.files.get(url) {
            Some(bytes) => Ok(bytes.clone()),
            None => bail!("404 not found"),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock decoder
// ---------------------------------------------------------------------------

/// Decodes byte streams to pre-registered images. Bytes starting with `BAD`
/// fail decoding; unregistered bytes are treated as non-raster content.
#[derive(Default)]
struct MockDecoder {
    images: HashMap<Vec<u8>, RasterImage>,
}

impl MockDecoder {
    fn with_image(mut self, bytes: &[u8], image: RasterImage) -> Self {
        self.images.insert(bytes.to_vec(), image);
        self
    }
}

#[async_trait]
impl MediaDecoder for MockDecoder {
    async fn decode(&self, bytes: &[u8], _declared_mime: &str) -> Result<Option<RasterImage>> {
        if bytes.starts_with(b"BAD") {
            bail!("corrupt image stream");
        }
        Ok(self.images.get(bytes).cloned())
    }
}

// ---------------------------------------------------------------------------
// Mock publication target
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockPublisher {
    remote: Mutex<HashMap<String, String>>,
    submits: Mutex<Vec<String>>,
    fail_remaining: AtomicU32,
}

impl MockPublisher {
    fn with_remote(self, digest: &ContentDigest, name: &str) -> Self {
        self.remote
            .lock()
            .unwrap()
            .insert(digest.0.clone(), name.to_string());
        self
    }

    fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    fn submitted(&self) -> Vec<String> {
        self.submits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn is_already_published(&self, digest: &ContentDigest) -> Result<Option<String>> {
        Ok(self.remote.lock().unwrap().get(&digest.0).cloned())
    }

    async fn submit(
        &self,
        _bytes: &[u8],
        proposed_name: &str,
        _record: &MediaRecord,
    ) -> Result<String> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            bail!("target rejected upload, try again later");
        }
        self.submits.lock().unwrap().push(proposed_name.to_string());
        Ok(proposed_name.to_string())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    catalog: Arc<MemoryCatalog>,
    index: Arc<HashAssociationIndex>,
    problems: Arc<ProblemTracker>,
    publisher: Arc<MockPublisher>,
    reconciler: Arc<Reconciler>,
    config: Config,
}

fn harness(decoder: MockDecoder, publisher: MockPublisher) -> Harness {
    init_tracing();
    let config = Config {
        publish_max_retries: 1,
        publish_backoff_ms: 1,
        ..Config::default()
    };
    let catalog = Arc::new(MemoryCatalog::new(Arc::new(AggregateCache::new())));
    let index = Arc::new(HashAssociationIndex::new());
    let problems = Arc::new(ProblemTracker::new());
    let publisher = Arc::new(publisher);
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&catalog) as Arc<dyn CatalogStore>,
        Arc::clone(&index),
        Arc::clone(&problems),
        Arc::new(decoder),
        Arc::clone(&publisher) as Arc<dyn Publisher>,
        config.clone(),
    ));
    Harness {
        catalog,
        index,
        problems,
        publisher,
        reconciler,
        config,
    }
}

fn candidate(stable_id: Option<&str>, title: &str, urls: &[&str]) -> RawCandidate {
    RawCandidate {
        stable_id: stable_id.map(String::from),
        title: title.to_string(),
        description: None,
        credit: None,
        published_at: None,
        keywords: None,
        files: urls
            .iter()
            .map(|u| RawFile {
                url: (*u).to_string(),
                mime: "image/jpeg".to_string(),
                file_name: None,
            })
            .collect(),
    }
}

/// Render a luma function over normalized coordinates; two renders of the
/// same function model the same photo exported twice.
fn render(width: u32, height: u32, f: impl Fn(f64, f64) -> f64) -> RasterImage {
    let mut luma = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let nx = f64::from(x) / f64::from(width - 1);
            let ny = f64::from(y) / f64::from(height - 1);
            luma.push((f(nx, ny) * 255.0).clamp(0.0, 255.0) as u8);
        }
    }
    RasterImage {
        width,
        height,
        luma,
    }
}

fn photo(x: f64, y: f64) -> f64 {
    0.5 + 0.25 * (6.1 * x).sin() * (4.3 * y).cos() + 0.2 * (2.0 * (x + y)).sin()
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_item_is_published_then_idempotent_on_reharvest() {
    let h = harness(
        MockDecoder::default().with_image(b"IMG-A", render(64, 64, photo)),
        MockPublisher::default(),
    );
    let adapter = MockAdapter::new("nasa").with_file("http://n/a.jpg", b"IMG-A");
    let cand = candidate(Some("PIA-1"), "Mars panorama", &["http://n/a.jpg"]);

    let mut stats = ReconcileStats::default();
    let outcome = h.reconciler.reconcile(&adapter, &cand, &mut stats).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::New);
    assert_eq!(h.publisher.submitted(), vec!["nasa PIA-1".to_string()]);

    let stored = h
        .catalog
        .get(&MediaId::new("nasa", "PIA-1"))
        .await
        .unwrap()
        .unwrap();
    assert!(stored.variants[0].published_names.contains("nasa PIA-1"));
    assert_eq!(stored.variants[0].digest, Some(hasher::digest(b"IMG-A")));

    // Second cycle: same item, updated title. No refetch, no resubmit.
    let fetches_before = adapter.fetches();
    let cand = candidate(Some("PIA-1"), "Mars panorama (color)", &["http://n/a.jpg"]);
    let outcome = h.reconciler.reconcile(&adapter, &cand, &mut stats).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::CatalogMatch);
    assert_eq!(adapter.fetches(), fetches_before);
    assert_eq!(h.publisher.submitted().len(), 1);

    let stored = h
        .catalog
        .get(&MediaId::new("nasa", "PIA-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.title, "Mars panorama (color)");
}

#[tokio::test]
async fn identical_bytes_at_two_urls_submit_once() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa")
        .with_file("http://n/a.jpg", b"SAME-BYTES")
        .with_file("http://n/a-copy.jpg", b"SAME-BYTES");
    let cand = candidate(
        Some("PIA-2"),
        "Two links, one file",
        &["http://n/a.jpg", "http://n/a-copy.jpg"],
    );

    let mut stats = ReconcileStats::default();
    h.reconciler.reconcile(&adapter, &cand, &mut stats).await.unwrap();

    let stored = h
        .catalog
        .get(&MediaId::new("nasa", "PIA-2"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.variants.len(), 2);
    assert_eq!(stored.variants[0].digest, stored.variants[1].digest);
    assert_eq!(stats.files_hashed, 2);
    // The same underlying content goes to the target exactly once; the
    // second carrier gets the accepted name mirrored onto it.
    assert_eq!(h.publisher.submitted(), vec!["nasa PIA-2".to_string()]);
    assert!(stored.variants[1].published_names.contains("nasa PIA-2"));
    assert!(!stored.variants[1].publishable());
}

#[tokio::test]
async fn reharvested_copy_of_own_published_content_is_not_resubmitted() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa")
        .with_file("http://n/a.jpg", b"ORIG")
        .with_file("http://n/a-alt.jpg", b"ORIG");

    let mut stats = ReconcileStats::default();
    h.reconciler
        .reconcile(&adapter, &candidate(Some("4"), "first", &["http://n/a.jpg"]), &mut stats)
        .await
        .unwrap();
    assert_eq!(h.publisher.submitted(), vec!["nasa 4".to_string()]);

    // Re-harvest adds a second URL carrying the item's own published bytes.
    h.reconciler
        .reconcile(
            &adapter,
            &candidate(Some("4"), "first", &["http://n/a.jpg", "http://n/a-alt.jpg"]),
            &mut stats,
        )
        .await
        .unwrap();
    assert_eq!(h.publisher.submitted().len(), 1);

    let stored = h
        .catalog
        .get(&MediaId::new("nasa", "4"))
        .await
        .unwrap()
        .unwrap();
    assert!(stored
        .variant_by_url("http://n/a-alt.jpg")
        .unwrap()
        .published_names
        .contains("nasa 4"));
}

#[tokio::test]
async fn byte_identical_content_across_sources_is_local_duplicate() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let nasa = MockAdapter::new("nasa").with_file("http://n/a.jpg", b"SHARED");
    let esa = MockAdapter::new("esa").with_file("http://e/mirror.jpg", b"SHARED");

    let mut stats = ReconcileStats::default();
    h.reconciler
        .reconcile(&nasa, &candidate(Some("1"), "original", &["http://n/a.jpg"]), &mut stats)
        .await
        .unwrap();

    let outcome = h
        .reconciler
        .reconcile(
            &esa,
            &candidate(Some("9"), "mirror", &["http://e/mirror.jpg"]),
            &mut stats,
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::LocalDuplicate);

    let mirror = h
        .catalog
        .get(&MediaId::new("esa", "9"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mirror.variants[0].duplicate_of, Some(MediaId::new("nasa", "1")));
    // Only the original was submitted.
    assert_eq!(h.publisher.submitted(), vec!["nasa 1".to_string()]);
}

#[tokio::test]
async fn reencoded_image_is_caught_by_fingerprint() {
    // Different bytes, perceptually the same picture.
    let h = harness(
        MockDecoder::default()
            .with_image(b"IMG-ORIG", render(64, 64, photo))
            .with_image(b"IMG-REENC", render(96, 96, |x, y| photo(x, y) + 0.02)),
        MockPublisher::default(),
    );
    let nasa = MockAdapter::new("nasa").with_file("http://n/a.jpg", b"IMG-ORIG");
    let esa = MockAdapter::new("esa").with_file("http://e/a.jpg", b"IMG-REENC");

    let mut stats = ReconcileStats::default();
    h.reconciler
        .reconcile(&nasa, &candidate(Some("1"), "original", &["http://n/a.jpg"]), &mut stats)
        .await
        .unwrap();

    let outcome = h
        .reconciler
        .reconcile(&esa, &candidate(Some("2"), "re-export", &["http://e/a.jpg"]), &mut stats)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::LocalDuplicate);
    assert_eq!(h.publisher.submitted().len(), 1);
}

#[tokio::test]
async fn content_already_at_target_is_never_resubmitted() {
    let publisher =
        MockPublisher::default().with_remote(&hasher::digest(b"OLD-UPLOAD"), "NASA Archive 7");
    let h = harness(MockDecoder::default(), publisher);
    let adapter = MockAdapter::new("nasa").with_file("http://n/old.jpg", b"OLD-UPLOAD");

    let mut stats = ReconcileStats::default();
    let outcome = h
        .reconciler
        .reconcile(
            &adapter,
            &candidate(Some("7"), "archive shot", &["http://n/old.jpg"]),
            &mut stats,
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::PublishedDuplicate);
    assert!(h.publisher.submitted().is_empty());

    let stored = h
        .catalog
        .get(&MediaId::new("nasa", "7"))
        .await
        .unwrap()
        .unwrap();
    assert!(stored.variants[0].published_names.contains("NASA Archive 7"));
}

#[tokio::test]
async fn conflicting_fingerprint_for_known_digest_fails_the_item() {
    let image = render(64, 64, photo);
    let h = harness(
        MockDecoder::default().with_image(b"IMG-A", image.clone()),
        MockPublisher::default(),
    );
    // The index already claims a different fingerprint for these bytes,
    // so hashing them again exposes a hashing bug.
    h.index
        .associate(HashAssociation {
            digest: hasher::digest(b"IMG-A"),
            fingerprint: PerceptualHash(!hasher::fingerprint(&image).0),
            mime: "image/jpeg".into(),
        })
        .unwrap();
    let adapter = MockAdapter::new("nasa").with_file("http://n/a.jpg", b"IMG-A");

    let mut stats = ReconcileStats::default();
    let outcome = h
        .reconciler
        .reconcile(&adapter, &candidate(Some("1"), "photo", &["http://n/a.jpg"]), &mut stats)
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Failed);
    assert_eq!(stats.integrity_errors, 1);
    assert!(h.publisher.submitted().is_empty());
    // The item never reaches the catalog.
    assert!(h.catalog.get(&MediaId::new("nasa", "1")).await.unwrap().is_none());
}

#[tokio::test]
async fn decode_failure_records_problem_and_siblings_continue() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa")
        .with_file("http://n/ok.jpg", b"FINE")
        .with_file("http://n/corrupt.jpg", b"BAD-STREAM");
    let cand = candidate(
        Some("3"),
        "mixed files",
        &["http://n/ok.jpg", "http://n/corrupt.jpg"],
    );

    let mut stats = ReconcileStats::default();
    h.reconciler.reconcile(&adapter, &cand, &mut stats).await.unwrap();

    assert_eq!(stats.files_hashed, 1);
    assert_eq!(stats.file_errors, 1);
    let problems = h.problems.list_by_source("nasa");
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].url, "http://n/corrupt.jpg");
    assert!(problems[0].message.starts_with("Decode error"));

    // The healthy sibling went all the way through.
    let stored = h
        .catalog
        .get(&MediaId::new("nasa", "3"))
        .await
        .unwrap()
        .unwrap();
    assert!(stored.variant_by_url("http://n/ok.jpg").unwrap().digest.is_some());
    assert!(stored
        .variant_by_url("http://n/corrupt.jpg")
        .unwrap()
        .digest
        .is_none());
    assert_eq!(h.publisher.submitted(), vec!["nasa 3".to_string()]);
}

#[tokio::test]
async fn missing_stable_id_fails_the_item_only() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa").with_file("http://n/x.jpg", b"X");

    let mut stats = ReconcileStats::default();
    let outcome = h
        .reconciler
        .reconcile(&adapter, &candidate(None, "untagged", &["http://n/x.jpg"]), &mut stats)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Failed);
    assert_eq!(h.problems.list_by_source("nasa").len(), 1);
    assert_eq!(h.catalog.count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn failed_publish_retries_on_next_cycle() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa").with_file("http://n/a.jpg", b"PAYLOAD");
    let cand = candidate(Some("5"), "flaky target", &["http://n/a.jpg"]);

    // Exhaust all attempts in the first cycle.
    h.publisher.fail_next(h.config.publish_max_retries + 1);
    let mut stats = ReconcileStats::default();
    let outcome = h.reconciler.reconcile(&adapter, &cand, &mut stats).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::New);
    assert_eq!(stats.publish_failures, 1);
    assert!(h.publisher.submitted().is_empty());
    let problems = h.problems.list_by_source("nasa");
    assert_eq!(problems.len(), 1);
    assert!(problems[0].message.starts_with("Publish error"));

    let stored = h
        .catalog
        .get(&MediaId::new("nasa", "5"))
        .await
        .unwrap()
        .unwrap();
    assert!(stored.variants[0].publishable());

    // Target recovers; the next harvest cycle picks the variant back up.
    let outcome = h.reconciler.reconcile(&adapter, &cand, &mut stats).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::CatalogMatch);
    assert_eq!(h.publisher.submitted(), vec!["nasa 5".to_string()]);
}

#[tokio::test]
async fn transient_publish_failure_is_retried_within_the_cycle() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa").with_file("http://n/a.jpg", b"PAYLOAD-2");

    h.publisher.fail_next(1);
    let mut stats = ReconcileStats::default();
    h.reconciler
        .reconcile(
            &adapter,
            &candidate(Some("6"), "one hiccup", &["http://n/a.jpg"]),
            &mut stats,
        )
        .await
        .unwrap();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.publish_failures, 0);
    assert_eq!(h.publisher.submitted(), vec!["nasa 6".to_string()]);
}

#[tokio::test]
async fn ignored_item_gets_metadata_merge_only() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa").with_file("http://n/a.jpg", b"IGNORED");
    let id = MediaId::new("nasa", "8");

    let mut stats = ReconcileStats::default();
    h.reconciler
        .reconcile(&adapter, &candidate(Some("8"), "first pass", &["http://n/a.jpg"]), &mut stats)
        .await
        .unwrap();
    h.catalog
        .set_ignored(&id, true, Some("not relevant".into()))
        .await
        .unwrap();

    let fetches_before = adapter.fetches();
    let submits_before = h.publisher.submitted().len();
    let outcome = h
        .reconciler
        .reconcile(
            &adapter,
            &candidate(Some("8"), "retitled", &["http://n/a.jpg"]),
            &mut stats,
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Ignored);
    assert_eq!(adapter.fetches(), fetches_before);
    assert_eq!(h.publisher.submitted().len(), submits_before);

    let stored = h.catalog.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.title, "retitled");
    assert_eq!(stored.ignored, Some(true));
}

#[tokio::test]
async fn second_variant_gets_disambiguated_name() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa")
        .with_file("http://n/a.jpg", b"FULL-RES")
        .with_file("http://n/a-thumb.jpg", b"THUMB");
    let mut cand = candidate(
        Some("42"),
        "with thumbnail",
        &["http://n/a.jpg", "http://n/a-thumb.jpg"],
    );
    cand.files[1].file_name = Some("a-thumb.jpg".into());

    let mut stats = ReconcileStats::default();
    h.reconciler.reconcile(&adapter, &cand, &mut stats).await.unwrap();

    let mut submitted = h.publisher.submitted();
    submitted.sort();
    assert_eq!(submitted, vec!["nasa 42".to_string(), "nasa 42 (a-thumb.jpg)".to_string()]);
}

// ---------------------------------------------------------------------------
// Harvest runs
// ---------------------------------------------------------------------------

fn runner(h: &Harness) -> HarvestRunner {
    HarvestRunner::new(
        Arc::clone(&h.reconciler),
        Arc::clone(&h.problems),
        h.config.clone(),
    )
}

#[tokio::test]
async fn harvest_drains_paged_feeds_across_sources() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let nasa = MockAdapter::new("nasa")
        .with_page(vec![candidate(Some("1"), "one", &["http://n/1.jpg"])])
        .with_page(vec![candidate(Some("2"), "two", &["http://n/2.jpg"])])
        .with_file("http://n/1.jpg", b"N1")
        .with_file("http://n/2.jpg", b"N2");
    let esa = MockAdapter::new("esa")
        .with_page(vec![candidate(Some("1"), "uno", &["http://e/1.jpg"])])
        .with_file("http://e/1.jpg", b"E1");

    let stats = runner(&h)
        .run(vec![Arc::new(nasa), Arc::new(esa)])
        .await;

    assert_eq!(stats.sources, 2);
    assert_eq!(stats.sources_failed, 0);
    assert_eq!(stats.batches, 3);
    assert_eq!(stats.reconcile.items, 3);
    assert_eq!(stats.reconcile.items_new, 3);
    assert_eq!(h.catalog.count(None).await.unwrap(), 3);
}

#[tokio::test]
async fn failing_source_does_not_take_down_the_run() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let mut broken = MockAdapter::new("esa");
    broken.fail_batches = true;
    let healthy = MockAdapter::new("nasa")
        .with_page(vec![candidate(Some("1"), "one", &["http://n/1.jpg"])])
        .with_file("http://n/1.jpg", b"N1");

    let stats = runner(&h)
        .run(vec![Arc::new(broken), Arc::new(healthy)])
        .await;

    assert_eq!(stats.sources, 2);
    assert_eq!(stats.sources_failed, 1);
    assert_eq!(stats.reconcile.items_new, 1);
    let problems = h.problems.list_by_source("esa");
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].url, "feed");
}

#[tokio::test]
async fn bad_item_does_not_abort_its_batch() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa")
        .with_page(vec![
            candidate(None, "untagged", &["http://n/bad.jpg"]),
            candidate(Some("2"), "fine", &["http://n/2.jpg"]),
        ])
        .with_file("http://n/2.jpg", b"N2");

    let stats = runner(&h).run(vec![Arc::new(adapter)]).await;

    assert_eq!(stats.reconcile.items, 2);
    assert_eq!(stats.reconcile.items_failed, 1);
    assert_eq!(stats.reconcile.items_new, 1);
    assert!(h.catalog.get(&MediaId::new("nasa", "2")).await.unwrap().is_some());
}

#[tokio::test]
async fn cancellation_stops_before_new_items() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let adapter = MockAdapter::new("nasa")
        .with_page(vec![candidate(Some("1"), "one", &["http://n/1.jpg"])])
        .with_file("http://n/1.jpg", b"N1");

    let runner = runner(&h);
    runner.cancel_flag().store(true, Ordering::SeqCst);
    let stats = runner.run(vec![Arc::new(adapter)]).await;

    assert!(stats.cancelled);
    assert_eq!(stats.reconcile.items, 0);
    assert_eq!(h.catalog.count(None).await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Stats surface after real runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aggregates_reflect_a_run_immediately() {
    let h = harness(MockDecoder::default(), MockPublisher::default());
    let stats_surface = CatalogStats::new(
        Arc::clone(&h.catalog) as Arc<dyn CatalogStore>,
        h.catalog.cache(),
    );

    let nasa = MockAdapter::new("nasa").with_file("http://n/a.jpg", b"SHARED");
    let esa = MockAdapter::new("esa").with_file("http://e/a.jpg", b"SHARED");

    let mut stats = ReconcileStats::default();
    h.reconciler
        .reconcile(&nasa, &candidate(Some("1"), "original", &["http://n/a.jpg"]), &mut stats)
        .await
        .unwrap();
    assert_eq!(stats_surface.media_count(None).await.unwrap(), 1);

    h.reconciler
        .reconcile(&esa, &candidate(Some("2"), "mirror", &["http://e/a.jpg"]), &mut stats)
        .await
        .unwrap();
    assert_eq!(stats_surface.media_count(None).await.unwrap(), 2);

    let dups = stats_surface.local_duplicates(Some("esa")).await.unwrap();
    assert_eq!(dups.len(), 1);
    assert_eq!(dups[0].duplicate_of, MediaId::new("nasa", "1"));
    // Hashed but non-raster content shows up as missing a fingerprint.
    let missing = stats_surface.missing_fingerprint(None).await.unwrap();
    assert_eq!(missing.len(), 2);
}

#[tokio::test]
async fn hash_index_accumulates_fingerprints() {
    let h = harness(
        MockDecoder::default().with_image(b"IMG-A", render(64, 64, photo)),
        MockPublisher::default(),
    );
    let adapter = MockAdapter::new("nasa").with_file("http://n/a.jpg", b"IMG-A");

    let mut stats = ReconcileStats::default();
    h.reconciler
        .reconcile(&adapter, &candidate(Some("1"), "photo", &["http://n/a.jpg"]), &mut stats)
        .await
        .unwrap();

    let digest = hasher::digest(b"IMG-A");
    assert_eq!(h.index.len(), 1);
    assert!(h.index.fingerprint_of(&digest).is_some());
}
