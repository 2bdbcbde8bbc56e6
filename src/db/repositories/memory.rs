use crate::db::models::{
    NewViolation, StoreStatus, ViolationFilter, ViolationRecord, DEFAULT_STATUS,
};
use crate::db::repositories::ViolationStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    records: Vec<ViolationRecord>,
}

/// In-process store with the same semantics as the PostgreSQL repository
#[derive(Default)]
pub struct MemoryViolationStore {
    state: RwLock<MemoryState>,
}

impl MemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record verbatim, bypassing normalization. Lets callers load
    /// rows whose `violation_data` is corrupt, as found in historic data.
    pub async fn insert_raw(
        &self,
        camera_id: &str,
        detected_at: DateTime<Utc>,
        violation_data: &str,
        total_violations: i64,
    ) -> ViolationRecord {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let record = ViolationRecord {
            id: state.next_id,
            camera_id: camera_id.to_string(),
            detected_at,
            violation_data: violation_data.to_string(),
            total_violations,
            source_file: None,
            image_path: None,
            status: DEFAULT_STATUS.to_string(),
            created_at: Utc::now(),
        };
        state.records.push(record.clone());
        record
    }
}

fn matches(record: &ViolationRecord, filter: &ViolationFilter) -> bool {
    filter
        .camera_id
        .as_ref()
        .map_or(true, |camera| &record.camera_id == camera)
        && filter
            .status
            .as_ref()
            .map_or(true, |status| &record.status == status)
}

fn newest_first(records: &mut [ViolationRecord]) {
    records.sort_by(|a, b| {
        b.detected_at
            .cmp(&a.detected_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[async_trait]
impl ViolationStore for MemoryViolationStore {
    async fn insert(&self, violation: &NewViolation) -> Result<ViolationRecord> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.next_id += 1;

        let record = ViolationRecord {
            id: state.next_id,
            camera_id: violation.camera_id.clone(),
            detected_at: violation.detected_at,
            violation_data: violation.violation_data(now).to_string(),
            total_violations: violation.total_violations,
            source_file: violation.source_file.clone(),
            image_path: violation.image_path.clone(),
            status: DEFAULT_STATUS.to_string(),
            created_at: now,
        };
        state.records.push(record.clone());

        Ok(record)
    }

    async fn find_near_duplicate(
        &self,
        camera_id: &str,
        detected_at: DateTime<Utc>,
        total_violations: i64,
        tolerance: Duration,
    ) -> Result<Option<i64>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.camera_id == camera_id && r.total_violations == total_violations)
            .filter(|r| (r.detected_at - detected_at).abs() <= tolerance)
            .map(|r| r.id)
            .min())
    }

    async fn query(&self, filter: &ViolationFilter) -> Result<Vec<ViolationRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<ViolationRecord> = state
            .records
            .iter()
            .filter(|r| matches(r, filter))
            .cloned()
            .collect();
        newest_first(&mut records);

        Ok(records
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn count(&self, filter: &ViolationFilter) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state.records.iter().filter(|r| matches(r, filter)).count() as i64)
    }

    async fn fetch_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ViolationRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<ViolationRecord> = state
            .records
            .iter()
            .filter(|r| since.map_or(true, |since| r.detected_at >= since))
            .cloned()
            .collect();
        newest_first(&mut records);
        Ok(records)
    }

    async fn status(&self) -> Result<StoreStatus> {
        let state = self.state.read().await;
        let records = &state.records;
        let cameras: HashSet<&str> = records.iter().map(|r| r.camera_id.as_str()).collect();

        Ok(StoreStatus {
            total_records: records.len() as i64,
            total_violations: records.iter().map(|r| r.total_violations).sum(),
            unique_cameras: cameras.len() as i64,
            earliest_detection: records.iter().map(|r| r.detected_at).min(),
            latest_detection: records.iter().map(|r| r.detected_at).max(),
            earliest_created: records.iter().map(|r| r.created_at).min(),
            latest_created: records.iter().map(|r| r.created_at).max(),
        })
    }

    async fn bulk_clear(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        let cleared = state.records.len() as u64;
        state.records.clear();
        Ok(cleared)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
