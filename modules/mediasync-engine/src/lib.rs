pub mod dedup;
pub mod harvest;
pub mod hasher;
pub mod identity;
pub mod reconcile;
pub mod traits;

pub use dedup::{Classification, DuplicateDetector};
pub use harvest::{HarvestRunner, HarvestStats};
pub use reconcile::{ReconcileOutcome, ReconcileStats, Reconciler};
pub use traits::{MediaDecoder, Publisher, RasterImage, SourceAdapter};
