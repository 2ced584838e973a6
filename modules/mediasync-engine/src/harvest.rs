//! Harvest orchestration: drives every configured source adapter through
//! its paged feed and hands each candidate to the reconciler.
//!
//! Sources run concurrently under a bounded fanout; items within one source
//! run sequentially so per-source ordering is preserved. A failing source
//! never takes down the run, and cancellation is honored between items.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use mediasync_catalog::ProblemTracker;
use mediasync_common::Config;

use crate::reconcile::{ReconcileStats, Reconciler};
use crate::traits::SourceAdapter;

/// Counters for one full harvest run across all sources.
#[derive(Debug, Default, Clone)]
pub struct HarvestStats {
    pub sources: u32,
    pub sources_failed: u32,
    pub batches: u32,
    pub cancelled: bool,
    pub reconcile: ReconcileStats,
}

impl HarvestStats {
    fn merge(&mut self, other: &HarvestStats) {
        self.sources += other.sources;
        self.sources_failed += other.sources_failed;
        self.batches += other.batches;
        self.cancelled |= other.cancelled;
        self.reconcile.merge(&other.reconcile);
    }
}

impl std::fmt::Display for HarvestStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Harvest Run Complete ===")?;
        writeln!(f, "Sources harvested:    {}", self.sources)?;
        writeln!(f, "Sources failed:       {}", self.sources_failed)?;
        writeln!(f, "Batches fetched:      {}", self.batches)?;
        if self.cancelled {
            writeln!(f, "Run cancelled early")?;
        }
        write!(f, "{}", self.reconcile)
    }
}

pub struct HarvestRunner {
    reconciler: Arc<Reconciler>,
    problems: Arc<ProblemTracker>,
    config: Config,
    cancelled: Arc<AtomicBool>,
}

impl HarvestRunner {
    pub fn new(
        reconciler: Arc<Reconciler>,
        problems: Arc<ProblemTracker>,
        config: Config,
    ) -> Self {
        Self {
            reconciler,
            problems,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for requesting an early, orderly stop. In-flight items finish;
    /// no new items start after the flag is observed.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn check_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            warn!("Cancellation requested, stopping harvest");
            return true;
        }
        false
    }

    /// Run one harvest cycle over the given adapters.
    pub async fn run(&self, adapters: Vec<Arc<dyn SourceAdapter>>) -> HarvestStats {
        info!(sources = adapters.len(), "Starting harvest run");

        let per_source: Vec<HarvestStats> = stream::iter(
            adapters
                .into_iter()
                .map(|adapter| async move { self.harvest_source(adapter).await }),
        )
        .buffer_unordered(self.config.max_concurrent_sources.max(1))
        .collect()
        .await;

        let mut stats = HarvestStats::default();
        for source_stats in &per_source {
            stats.merge(source_stats);
        }
        info!("\n{stats}");
        stats
    }

    /// Drain one source's paged feed. Page fetch failures end this source's
    /// cycle; reconciliation failures of individual items do not.
    async fn harvest_source(&self, adapter: Arc<dyn SourceAdapter>) -> HarvestStats {
        let namespace = adapter.namespace();
        let mut stats = HarvestStats {
            sources: 1,
            ..HarvestStats::default()
        };

        info!(namespace, "Harvesting source");
        let mut cursor: Option<String> = None;
        loop {
            if self.check_cancelled() {
                stats.cancelled = true;
                break;
            }

            let batch = match adapter.next_batch(cursor.as_deref()).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(namespace, error = %e, "Batch fetch failed");
                    // The failure belongs to the feed itself, not any file.
                    self.problems
                        .report(namespace, "feed", format!("Batch fetch failed: {e}"));
                    stats.sources_failed = 1;
                    break;
                }
            };
            stats.batches += 1;

            for candidate in &batch.candidates {
                if self.check_cancelled() {
                    stats.cancelled = true;
                    break;
                }
                if let Err(e) = self
                    .reconciler
                    .reconcile(adapter.as_ref(), candidate, &mut stats.reconcile)
                    .await
                {
                    warn!(namespace, title = %candidate.title, error = %e, "Reconciliation aborted");
                    stats.reconcile.items += 1;
                    stats.reconcile.items_failed += 1;
                }
            }

            cursor = batch.next_cursor;
            if stats.cancelled || cursor.is_none() {
                break;
            }
        }

        info!(
            namespace,
            items = stats.reconcile.items,
            batches = stats.batches,
            "Source harvest finished"
        );
        stats
    }
}
