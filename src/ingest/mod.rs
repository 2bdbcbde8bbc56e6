pub mod dedup;
pub mod normalizer;
pub mod pipeline;
pub mod watcher;
pub mod weighting;

pub use dedup::{DedupGuard, DedupKey, SeenHashes};
pub use normalizer::{normalize, normalize_bytes, Provenance};
pub use pipeline::{RecordOutcome, ViolationPipeline};
pub use watcher::{DropDirSummary, FileOutcome, IngestWatcher, TickReport, WatcherStats};
