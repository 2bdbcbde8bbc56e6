use crate::db::models::{NewViolation, MAX_VIOLATION_COUNT};
use crate::error::Error;
use crate::ingest::normalizer::{normalize, Provenance};
use crate::ingest::pipeline::{RecordOutcome, ViolationPipeline};
use crate::utils::timeparse::parse_timestamp;
use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

const SOURCE_LABEL: &str = "api";

/// Marker left behind when an object was stringified by a careless client
const OBJECT_MARKER: &str = "[object Object]";

/// Direct violation submission
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ViolationSubmission {
    #[serde(default, alias = "cameraId")]
    pub camera_id: Option<String>,
    #[serde(default, alias = "timestamp")]
    pub detection_timestamp: Option<Value>,
    /// Breakdown document, as an object or as its JSON text
    #[serde(default)]
    pub violation_data: Option<Value>,
    #[serde(default)]
    pub total_violations: Option<Value>,
    #[serde(default)]
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReceipt {
    pub record_id: i64,
    pub duplicate: bool,
}

impl From<&RecordOutcome> for SubmissionReceipt {
    fn from(outcome: &RecordOutcome) -> Self {
        Self {
            record_id: outcome.record_id(),
            duplicate: outcome.is_duplicate(),
        }
    }
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    Error::Validation(message.into()).into()
}

/// Decode `violation_data` into its document, rejecting corrupted payloads
fn violation_document(data: Option<&Value>) -> Result<Map<String, Value>> {
    let document = match data {
        Some(Value::String(text)) => {
            let text = text.trim();
            if text.is_empty() || text == "null" || text.contains(OBJECT_MARKER) {
                return Err(invalid("violation_data is empty or corrupted"));
            }
            serde_json::from_str::<Value>(text)
                .map_err(|e| invalid(format!("violation_data is not valid JSON: {}", e)))?
        }
        Some(value @ Value::Object(_)) => {
            if value.to_string().contains(OBJECT_MARKER) {
                return Err(invalid("violation_data contains corrupted values"));
            }
            value.clone()
        }
        Some(Value::Null) | None => return Err(invalid("violation_data is required")),
        Some(_) => return Err(invalid("violation_data must be an object or JSON text")),
    };

    match document {
        Value::Object(map) => Ok(map),
        _ => Err(invalid("violation_data must decode to an object")),
    }
}

/// A JSON number holding a whole count within `0..=MAX_VIOLATION_COUNT`
fn whole_count(value: &Value) -> Option<i64> {
    let count = match value.as_i64() {
        Some(count) => count,
        None => {
            let float = value.as_f64().filter(|f| f.fract() == 0.0)?;
            if !(0.0..=MAX_VIOLATION_COUNT as f64).contains(&float) {
                return None;
            }
            float as i64
        }
    };
    (0..=MAX_VIOLATION_COUNT).contains(&count).then_some(count)
}

/// Structural checks on a submission, then normalization into an event
pub fn validate(submission: &ViolationSubmission) -> Result<NewViolation> {
    let camera_id = submission
        .camera_id
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| invalid("camera_id is required"))?;

    let raw_timestamp = submission
        .detection_timestamp
        .as_ref()
        .filter(|t| !t.is_null())
        .ok_or_else(|| invalid("detection_timestamp is required"))?;
    if parse_timestamp(raw_timestamp).is_none() {
        return Err(invalid(format!(
            "detection_timestamp is not a recognised time: {}",
            raw_timestamp
        )));
    }

    let document = violation_document(submission.violation_data.as_ref())?;
    let violations = document
        .get("violations")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("violation_data.violations must be an object"))?;

    let mut breakdown_total: i64 = 0;
    for (violation_type, count) in violations {
        let count = whole_count(count).ok_or_else(|| {
            invalid(format!(
                "count for '{}' must be an integer between 0 and {}, got {}",
                violation_type, MAX_VIOLATION_COUNT, count
            ))
        })?;
        breakdown_total = breakdown_total.saturating_add(count);
    }
    if breakdown_total > MAX_VIOLATION_COUNT {
        return Err(invalid(format!(
            "violation counts add up to {}, above the limit of {}",
            breakdown_total, MAX_VIOLATION_COUNT
        )));
    }

    let mut raw = json!({
        "camera_id": camera_id,
        "timestamp": raw_timestamp,
        "violations": violations,
    });
    if let Some(obj) = raw.as_object_mut() {
        let stated_total = submission
            .total_violations
            .clone()
            .or_else(|| document.get("total_violations").cloned());
        if let Some(total) = stated_total.filter(|t| !t.is_null()) {
            if whole_count(&total).is_none() {
                return Err(invalid(format!(
                    "total_violations must be an integer between 0 and {}, got {}",
                    MAX_VIOLATION_COUNT, total
                )));
            }
            obj.insert("total_violations".to_string(), total);
        }
        if let Some(image_path) = &submission.image_path {
            obj.insert("image_path".to_string(), json!(image_path));
        }
    }

    normalize(
        &raw,
        Provenance {
            label: SOURCE_LABEL,
            file_name: None,
            received_at: Utc::now(),
        },
    )
}

/// Synchronous alternative to the drop directory
pub struct SubmissionService {
    pipeline: Arc<ViolationPipeline>,
}

impl SubmissionService {
    pub fn new(pipeline: Arc<ViolationPipeline>) -> Self {
        Self { pipeline }
    }

    /// Validate and store a submission. Duplicates are reported with the
    /// id of the record already stored.
    pub async fn submit(&self, submission: &ViolationSubmission) -> Result<SubmissionReceipt> {
        let event = match validate(submission) {
            Ok(event) => event,
            Err(e) => {
                warn!("Rejected violation submission: {}", e);
                return Err(e);
            }
        };

        // Store probe only: submissions do not share the watcher's key cache
        let outcome = self.pipeline.record(&event, None).await?;
        if outcome.is_duplicate() {
            info!("Submission for {} already recorded", event.camera_id);
        }

        Ok(SubmissionReceipt::from(&outcome))
    }
}
