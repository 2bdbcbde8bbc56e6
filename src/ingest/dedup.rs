use crate::db::models::NewViolation;
use crate::db::repositories::ViolationStore;
use anyhow::Result;
use chrono::Duration;
use log::debug;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Content hash identifying one physical detection occurrence
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    /// Hash of camera, detection second, breakdown and total. Provenance
    /// fields are left out so the same event dropped twice hashes the same.
    pub fn for_event(event: &NewViolation) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(event.camera_id.as_bytes());
        hasher.update(b"|");
        hasher.update(event.detected_at.timestamp().to_be_bytes());
        hasher.update(b"|");
        // BTreeMap iteration is sorted, so equal breakdowns hash equally
        for (violation_type, count) in &event.violations {
            hasher.update(violation_type.as_bytes());
            hasher.update(b"=");
            hasher.update(count.to_be_bytes());
            hasher.update(b";");
        }
        hasher.update(b"|");
        hasher.update(event.total_violations.to_be_bytes());

        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DedupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..12])
    }
}

/// Keys seen since process start, mapped to the id of the stored record
#[derive(Debug, Default)]
pub struct SeenHashes {
    entries: HashMap<DedupKey, i64>,
}

impl SeenHashes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DedupKey) -> Option<i64> {
        self.entries.get(key).copied()
    }

    pub fn remember(&mut self, key: DedupKey, record_id: i64) {
        self.entries.insert(key, record_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Result of a duplicate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupVerdict {
    Fresh(DedupKey),
    Duplicate { existing_id: i64 },
}

/// Two-tier duplicate check: the in-memory key set first, then a store probe
/// for a record of the same camera and total within the tolerance window.
/// The store probe alone decides correctness; the set only saves round trips.
pub struct DedupGuard {
    store: Arc<dyn ViolationStore>,
    tolerance: Duration,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn ViolationStore>, tolerance: Duration) -> Self {
        Self { store, tolerance }
    }

    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    pub async fn check(
        &self,
        event: &NewViolation,
        seen: Option<&SeenHashes>,
    ) -> Result<DedupVerdict> {
        let key = DedupKey::for_event(event);

        if let Some(existing_id) = seen.and_then(|seen| seen.get(&key)) {
            debug!("Dedup key {} already seen as record {}", key, existing_id);
            return Ok(DedupVerdict::Duplicate { existing_id });
        }

        let probe = self
            .store
            .find_near_duplicate(
                &event.camera_id,
                event.detected_at,
                event.total_violations,
                self.tolerance,
            )
            .await?;

        Ok(match probe {
            Some(existing_id) => DedupVerdict::Duplicate { existing_id },
            None => DedupVerdict::Fresh(key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Breakdown;
    use crate::db::repositories::MemoryViolationStore;
    use chrono::{TimeZone, Utc};

    fn event(camera_id: &str, second: u32, mask: i64) -> NewViolation {
        let mut violations = Breakdown::new();
        violations.insert("mask".to_string(), mask);
        NewViolation {
            camera_id: camera_id.to_string(),
            detected_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, second).unwrap(),
            violations,
            total_violations: mask,
            source_label: "ingest".to_string(),
            source_file: Some(format!("D11_{}.json", second)),
            image_path: None,
        }
    }

    #[test]
    fn key_ignores_provenance_but_not_content() {
        let a = event("cam_11", 0, 2);
        let mut b = a.clone();
        b.source_file = Some("copy.json".to_string());
        b.source_label = "api".to_string();
        assert_eq!(DedupKey::for_event(&a), DedupKey::for_event(&b));

        assert_ne!(DedupKey::for_event(&a), DedupKey::for_event(&event("cam_11", 1, 2)));
        assert_ne!(DedupKey::for_event(&a), DedupKey::for_event(&event("cam_28", 0, 2)));
        assert_ne!(DedupKey::for_event(&a), DedupKey::for_event(&event("cam_11", 0, 3)));
        assert_eq!(DedupKey::for_event(&a).as_str().len(), 64);
    }

    #[tokio::test]
    async fn memory_tier_short_circuits_the_store() -> Result<()> {
        let guard = DedupGuard::new(Arc::new(MemoryViolationStore::new()), Duration::seconds(2));
        let first = event("cam_11", 0, 2);

        let key = match guard.check(&first, None).await? {
            DedupVerdict::Fresh(key) => key,
            other => panic!("expected fresh, got {:?}", other),
        };

        let mut seen = SeenHashes::new();
        seen.remember(key, 7);
        assert_eq!(
            guard.check(&first, Some(&seen)).await?,
            DedupVerdict::Duplicate { existing_id: 7 }
        );
        Ok(())
    }

    #[tokio::test]
    async fn store_probe_catches_near_duplicates_across_restarts() -> Result<()> {
        let store = Arc::new(MemoryViolationStore::new());
        let stored = store.insert(&event("cam_11", 0, 2)).await?;
        let guard = DedupGuard::new(store, Duration::seconds(2));

        // fresh process: empty key set, detection one second later
        let verdict = guard.check(&event("cam_11", 1, 2), Some(&SeenHashes::new())).await?;
        assert_eq!(verdict, DedupVerdict::Duplicate { existing_id: stored.id });

        let verdict = guard.check(&event("cam_11", 5, 2), None).await?;
        assert!(matches!(verdict, DedupVerdict::Fresh(_)));
        Ok(())
    }
}
