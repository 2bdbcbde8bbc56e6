use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-type violation counts, keyed by violation label ("mask", "hat", ...)
pub type Breakdown = BTreeMap<String, i64>;

/// Camera id used when no camera can be resolved from the input
pub const UNKNOWN_CAMERA: &str = "unknown";

/// Status every record is stored with
pub const DEFAULT_STATUS: &str = "detected";

/// Largest count accepted for one violation type or for a record total
pub const MAX_VIOLATION_COUNT: i64 = 1_000_000_000;

/// A normalized violation event that has not been stored yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewViolation {
    pub camera_id: String,
    pub detected_at: DateTime<Utc>,
    pub violations: Breakdown,
    pub total_violations: i64,
    /// Where the event came from ("ingest", "api"), kept for diagnostics
    pub source_label: String,
    pub source_file: Option<String>,
    pub image_path: Option<String>,
}

impl NewViolation {
    /// Build the JSON document persisted in the `violation_data` column
    pub fn violation_data(&self, processed_at: DateTime<Utc>) -> serde_json::Value {
        let mut data = serde_json::json!({
            "violations": self.violations,
            "total_violations": self.total_violations,
            "camera_id": self.camera_id,
            "source": self.source_label,
            "processed_at": processed_at.to_rfc3339(),
        });

        if let (Some(source_file), Some(obj)) = (&self.source_file, data.as_object_mut()) {
            obj.insert("source_file".to_string(), serde_json::json!(source_file));
        }

        data
    }

    /// Sum of the breakdown counts
    pub fn breakdown_sum(&self) -> i64 {
        self.violations
            .values()
            .fold(0i64, |sum, count| sum.saturating_add(*count))
    }
}

/// A stored violation row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ViolationRecord {
    pub id: i64,
    pub camera_id: String,
    pub detected_at: DateTime<Utc>,
    /// Raw JSON document; parsed lazily because historic rows may be corrupt
    pub violation_data: String,
    pub total_violations: i64,
    pub source_file: Option<String>,
    pub image_path: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl ViolationRecord {
    /// Parse the per-type breakdown out of `violation_data`.
    ///
    /// Returns `None` when the document is not JSON or has no `violations`
    /// object. Entries that are not positive numbers are left out.
    pub fn breakdown(&self) -> Option<Breakdown> {
        parse_breakdown_document(&self.violation_data)
    }

    /// Public shape of the record used by the API and the live channel
    pub fn to_view(&self) -> ViolationView {
        let breakdown = self.breakdown();
        ViolationView {
            id: self.id,
            camera_id: self.camera_id.clone(),
            detected_at: self.detected_at,
            breakdown_valid: breakdown.is_some(),
            violations: breakdown.unwrap_or_default(),
            total_violations: self.total_violations,
            source_file: self.source_file.clone(),
            image_path: self.image_path.clone(),
            status: self.status.clone(),
            created_at: self.created_at,
        }
    }
}

pub fn parse_breakdown_document(document: &str) -> Option<Breakdown> {
    let value: serde_json::Value = serde_json::from_str(document).ok()?;
    let violations = value.get("violations")?.as_object()?;

    let mut breakdown = Breakdown::new();
    for (violation_type, count) in violations {
        let count = match count.as_i64() {
            Some(c) => c,
            None => match count.as_f64() {
                Some(c) if c.fract() == 0.0 => c as i64,
                _ => continue,
            },
        };
        if count > 0 {
            breakdown.insert(violation_type.clone(), count);
        }
    }

    Some(breakdown)
}

/// Violation as sent to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationView {
    pub id: i64,
    pub camera_id: String,
    pub detected_at: DateTime<Utc>,
    pub violations: Breakdown,
    pub breakdown_valid: bool,
    pub total_violations: i64,
    pub source_file: Option<String>,
    pub image_path: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for paged queries, results ordered by `detected_at` descending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationFilter {
    pub camera_id: Option<String>,
    pub status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl ViolationFilter {
    /// Filter for a topic as used by the live channel ("all" means no camera filter)
    pub fn for_topic(topic: &str, status: Option<String>, limit: i64) -> Self {
        Self {
            camera_id: if topic == "all" {
                None
            } else {
                Some(topic.to_string())
            },
            status,
            limit,
            offset: 0,
        }
    }
}

impl Default for ViolationFilter {
    fn default() -> Self {
        Self {
            camera_id: None,
            status: None,
            limit: 20,
            offset: 0,
        }
    }
}

/// Whole-table summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoreStatus {
    pub total_records: i64,
    pub total_violations: i64,
    pub unique_cameras: i64,
    pub earliest_detection: Option<DateTime<Utc>>,
    pub latest_detection: Option<DateTime<Utc>>,
    pub earliest_created: Option<DateTime<Utc>>,
    pub latest_created: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(document: &str) -> ViolationRecord {
        ViolationRecord {
            id: 1,
            camera_id: "cam_11".to_string(),
            detected_at: Utc::now(),
            violation_data: document.to_string(),
            total_violations: 3,
            source_file: None,
            image_path: None,
            status: DEFAULT_STATUS.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn breakdown_skips_non_positive_and_non_numeric_entries() {
        let rec = record(r#"{"violations": {"mask": 2, "hat": 0, "phone": -1, "uniform": "x", "cigarette": 1.0}}"#);
        let breakdown = rec.breakdown().unwrap();
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown["mask"], 2);
        assert_eq!(breakdown["cigarette"], 1);
    }

    #[test]
    fn corrupt_documents_have_no_breakdown() {
        assert!(record("[object Object]").breakdown().is_none());
        assert!(record(r#"{"total_violations": 3}"#).breakdown().is_none());
        assert!(record(r#"{"violations": [1, 2]}"#).breakdown().is_none());

        let view = record("not json").to_view();
        assert!(!view.breakdown_valid);
        assert!(view.violations.is_empty());
        assert_eq!(view.total_violations, 3);
    }

    #[test]
    fn violation_data_carries_provenance() {
        let mut violations = Breakdown::new();
        violations.insert("mask".to_string(), 2);
        let event = NewViolation {
            camera_id: "cam_28".to_string(),
            detected_at: Utc::now(),
            violations,
            total_violations: 2,
            source_label: "ingest".to_string(),
            source_file: Some("D28_a.json".to_string()),
            image_path: None,
        };

        let data = event.violation_data(Utc::now());
        assert_eq!(data["source_file"], "D28_a.json");
        assert_eq!(data["violations"]["mask"], 2);
        assert_eq!(parse_breakdown_document(&data.to_string()).unwrap(), event.violations);
    }

    #[test]
    fn topic_all_means_no_camera_filter() {
        assert_eq!(ViolationFilter::for_topic("all", None, 5).camera_id, None);
        assert_eq!(
            ViolationFilter::for_topic("cam_11", None, 5).camera_id.as_deref(),
            Some("cam_11")
        );
    }
}
