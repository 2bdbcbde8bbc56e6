use crate::db::models::{NewViolation, ViolationRecord};
use crate::db::repositories::ViolationStore;
use crate::ingest::dedup::{DedupGuard, DedupKey, DedupVerdict, SeenHashes};
use crate::messaging::{LiveHub, ViolationEvents};
use anyhow::Result;
use chrono::Duration;
use log::{error, info};
use std::sync::Arc;

/// What happened to a normalized event
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Inserted(ViolationRecord),
    /// The occurrence was already stored under `existing_id`
    Duplicate { existing_id: i64 },
}

impl RecordOutcome {
    pub fn record_id(&self) -> i64 {
        match self {
            Self::Inserted(record) => record.id,
            Self::Duplicate { existing_id } => *existing_id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// Dedup check, persist and broadcast for normalized events. Shared by the
/// drop-directory watcher and the submission API.
pub struct ViolationPipeline {
    store: Arc<dyn ViolationStore>,
    guard: DedupGuard,
    hub: LiveHub,
    events: Option<Arc<ViolationEvents>>,
}

impl ViolationPipeline {
    pub fn new(store: Arc<dyn ViolationStore>, tolerance: Duration, hub: LiveHub) -> Self {
        Self {
            guard: DedupGuard::new(store.clone(), tolerance),
            store,
            hub,
            events: None,
        }
    }

    /// Also relay stored violations to the message broker
    pub fn with_events(mut self, events: Arc<ViolationEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &Arc<dyn ViolationStore> {
        &self.store
    }

    pub fn hub(&self) -> &LiveHub {
        &self.hub
    }

    /// Store `event` unless it is a duplicate. `seen` is the caller's
    /// in-memory key set, consulted first and updated with the outcome.
    pub async fn record(
        &self,
        event: &NewViolation,
        mut seen: Option<&mut SeenHashes>,
    ) -> Result<RecordOutcome> {
        let verdict = self.guard.check(event, seen.as_deref()).await?;
        let key = match verdict {
            DedupVerdict::Duplicate { existing_id } => {
                if let Some(seen) = seen {
                    seen.remember(DedupKey::for_event(event), existing_id);
                }
                info!(
                    "Duplicate violation for {} at {} (already recorded as {})",
                    event.camera_id, event.detected_at, existing_id
                );
                return Ok(RecordOutcome::Duplicate { existing_id });
            }
            DedupVerdict::Fresh(key) => key,
        };

        let record = self.store.insert(event).await?;
        if let Some(seen) = seen.as_mut() {
            seen.remember(key, record.id);
        }

        info!(
            "Recorded violation {} for {}: {} violations ({})",
            record.id, record.camera_id, record.total_violations, event.source_label
        );

        self.notify(&record);
        Ok(RecordOutcome::Inserted(record))
    }

    fn notify(&self, record: &ViolationRecord) {
        let view = record.to_view();

        if let Some(events) = &self.events {
            let events = events.clone();
            let view = view.clone();
            tokio::spawn(async move {
                if let Err(e) = events.violation_recorded(&view).await {
                    error!("Failed to relay violation {} to broker: {}", view.id, e);
                }
            });
        }

        self.hub.publish(view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Breakdown, ViolationFilter};
    use crate::db::repositories::MemoryViolationStore;
    use crate::messaging::TOPIC_ALL;
    use chrono::{TimeZone, Utc};

    fn event(second: u32) -> NewViolation {
        let mut violations = Breakdown::new();
        violations.insert("mask".to_string(), 2);
        violations.insert("hat".to_string(), 1);
        NewViolation {
            camera_id: "cam_11".to_string(),
            detected_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, second).unwrap(),
            violations,
            total_violations: 3,
            source_label: "api".to_string(),
            source_file: None,
            image_path: None,
        }
    }

    fn pipeline(store: Arc<MemoryViolationStore>, hub: LiveHub) -> ViolationPipeline {
        ViolationPipeline::new(store, Duration::seconds(2), hub)
    }

    #[tokio::test]
    async fn same_occurrence_twice_is_stored_once() -> Result<()> {
        let store = Arc::new(MemoryViolationStore::new());
        let pipeline = pipeline(store.clone(), LiveHub::new(8));

        let first = pipeline.record(&event(0), None).await?;
        let second = pipeline.record(&event(0), None).await?;

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(second.record_id(), first.record_id());
        assert_eq!(store.count(&ViolationFilter::default()).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn inserts_are_broadcast_and_duplicates_are_not() -> Result<()> {
        let hub = LiveHub::new(8);
        let mut subscriber = hub.subscribe(TOPIC_ALL);
        let pipeline = pipeline(Arc::new(MemoryViolationStore::new()), hub);
        let mut seen = SeenHashes::new();

        let stored = pipeline.record(&event(0), Some(&mut seen)).await?;
        pipeline.record(&event(1), Some(&mut seen)).await?;

        let pushed = subscriber.next().await.expect("one push");
        assert_eq!(pushed.id, stored.record_id());
        assert_eq!(pushed.violations["mask"], 2);
        assert_eq!(seen.len(), 2);
        assert_eq!(pipeline.hub().subscriber_count(), 1);

        let nothing_else =
            tokio::time::timeout(std::time::Duration::from_millis(50), subscriber.next()).await;
        assert!(nothing_else.is_err());
        Ok(())
    }
}
