use crate::db::models::{NewViolation, StoreStatus, ViolationFilter, ViolationRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

pub mod memory;
pub mod violations;

pub use memory::MemoryViolationStore;
pub use violations::ViolationsRepository;

/// Append-only storage of violation records.
///
/// Every method fails with `Error::Database` on connectivity problems. There is
/// no update operation; records leave the store only through `bulk_clear`.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    /// Persist one record atomically and return it with its assigned id
    async fn insert(&self, violation: &NewViolation) -> Result<ViolationRecord>;

    /// Id of an existing record for the same camera and total whose detection
    /// time lies within `tolerance` of `detected_at`
    async fn find_near_duplicate(
        &self,
        camera_id: &str,
        detected_at: DateTime<Utc>,
        total_violations: i64,
        tolerance: Duration,
    ) -> Result<Option<i64>>;

    /// One page of records, newest detection first
    async fn query(&self, filter: &ViolationFilter) -> Result<Vec<ViolationRecord>>;

    /// Number of records matching the filter's camera and status (paging ignored)
    async fn count(&self, filter: &ViolationFilter) -> Result<i64>;

    /// All records detected at or after `since` (everything when `None`), newest first
    async fn fetch_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ViolationRecord>>;

    async fn status(&self) -> Result<StoreStatus>;

    /// Delete every record and return how many were removed
    async fn bulk_clear(&self) -> Result<u64>;

    async fn health_check(&self) -> Result<bool>;
}
