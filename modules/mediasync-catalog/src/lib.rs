pub mod cache;
pub mod hash_index;
pub mod problems;
pub mod stats;
pub mod store;

pub use cache::AggregateCache;
pub use hash_index::HashAssociationIndex;
pub use problems::ProblemTracker;
pub use stats::CatalogStats;
pub use store::{CatalogStore, MemoryCatalog};
