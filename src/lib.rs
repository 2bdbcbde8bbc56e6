pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod messaging;
pub mod services;
pub mod utils;

// Re-export main components for easier use
pub use db::models::{NewViolation, ViolationRecord, ViolationView};
pub use error::Error;
pub use ingest::{IngestWatcher, RecordOutcome, ViolationPipeline};
pub use messaging::LiveHub;
