use crate::db::models::{Breakdown, NewViolation, MAX_VIOLATION_COUNT, UNKNOWN_CAMERA};
use crate::error::Error;
use crate::ingest::weighting::synthesize_breakdown;
use crate::utils::timeparse::{parse_timestamp, truncate_to_seconds};
use anyhow::Result;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::Path;

/// Detector output files are named like `D11_20240101_1200.json`
static CAMERA_FILE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^D(\d+)").expect("camera prefix pattern is valid"));

const CAMERA_KEYS: &[&str] = &["camera_id", "cameraId"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "detection_timestamp", "detected_at"];
/// A payload must carry at least one of these to count as a detection record
const DETECTION_KEYS: &[&str] = &["violations", "total_violations", "class_numbers", "raw_data"];

/// Where a payload came from
#[derive(Debug, Clone, Copy)]
pub struct Provenance<'a> {
    /// "ingest" for drop-directory files, "api" for direct submissions
    pub label: &'a str,
    pub file_name: Option<&'a str>,
    pub received_at: DateTime<Utc>,
}

/// Parse raw file contents and normalize them.
pub fn normalize_bytes(bytes: &[u8], provenance: Provenance<'_>) -> Result<NewViolation> {
    let raw: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::MalformedInput(format!("invalid JSON: {}", e)))?;
    normalize(&raw, provenance)
}

/// Convert an arbitrary detection payload into a canonical violation event.
///
/// An explicit breakdown wins and its sum becomes the total. Without one the
/// breakdown is inferred from per-class object counts, and failing that it is
/// synthesized from the scalar total using the camera's weight profile.
pub fn normalize(raw: &Value, provenance: Provenance<'_>) -> Result<NewViolation> {
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::MalformedInput("payload is not a JSON object".to_string()))?;

    if !DETECTION_KEYS.iter().any(|key| obj.contains_key(*key)) {
        return Err(Error::MalformedInput(
            "payload carries no violations, totals or class counts".to_string(),
        )
        .into());
    }

    let camera_id = extract_camera_id(raw, provenance.file_name);
    let nested = raw.get("raw_data");

    let mut violations = breakdown_from(raw.get("violations"))?;
    if violations.is_empty() {
        violations = breakdown_from(nested.and_then(|n| n.get("violations")))?;
    }
    if violations.is_empty() {
        if let Some(class_numbers) = raw
            .get("class_numbers")
            .or_else(|| nested.and_then(|n| n.get("class_numbers")))
        {
            violations = infer_from_class_numbers(class_numbers)?;
        }
    }

    let total_violations = if violations.is_empty() {
        let total = match raw.get("total_violations").and_then(count_value) {
            Some(total) => bounded_count("total_violations", total)?.max(0),
            None => 0,
        };
        violations = synthesize_breakdown(total, &camera_id);
        total
    } else {
        let sum = violations
            .values()
            .try_fold(0i64, |sum, count| sum.checked_add(*count))
            .ok_or_else(|| Error::MalformedInput("violation counts overflow".to_string()))?;
        bounded_count("total_violations", sum)?
    };

    let detected_at = TIMESTAMP_KEYS
        .iter()
        .filter_map(|key| raw.get(*key))
        .find_map(parse_timestamp)
        .or_else(|| truncate_to_seconds(provenance.received_at))
        .unwrap_or(provenance.received_at);

    let image_path = raw
        .get("image_path")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(NewViolation {
        camera_id,
        detected_at,
        violations,
        total_violations,
        source_label: provenance.label.to_string(),
        source_file: provenance.file_name.map(str::to_string),
        image_path,
    })
}

/// Camera id from an explicit field, then the file naming convention, then "unknown"
pub fn extract_camera_id(raw: &Value, file_name: Option<&str>) -> String {
    let explicit = CAMERA_KEYS.iter().filter_map(|key| raw.get(*key)).find_map(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    explicit
        .or_else(|| file_name.and_then(camera_from_file_name))
        .unwrap_or_else(|| UNKNOWN_CAMERA.to_string())
}

/// `D11_20240101_1200.json` belongs to `cam_11`
pub fn camera_from_file_name(file_name: &str) -> Option<String> {
    let base = Path::new(file_name).file_name()?.to_str()?;
    CAMERA_FILE_PREFIX
        .captures(base)
        .and_then(|caps| caps.get(1))
        .map(|digits| format!("cam_{}", digits.as_str()))
}

/// Numeric count from a number or a numeric string
fn count_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// Counts beyond `MAX_VIOLATION_COUNT` are not detector output
fn bounded_count(field: &str, count: i64) -> Result<i64> {
    if count > MAX_VIOLATION_COUNT {
        return Err(Error::MalformedInput(format!(
            "{} of {} exceeds the limit of {}",
            field, count, MAX_VIOLATION_COUNT
        ))
        .into());
    }
    Ok(count)
}

/// Positive entries of a breakdown object; anything else contributes nothing
fn breakdown_from(value: Option<&Value>) -> Result<Breakdown> {
    let mut breakdown = Breakdown::new();
    if let Some(entries) = value.and_then(Value::as_object) {
        for (violation_type, count) in entries {
            if let Some(count) = count_value(count).filter(|c| *c > 0) {
                breakdown.insert(violation_type.clone(), bounded_count(violation_type, count)?);
            }
        }
    }
    Ok(breakdown)
}

/// Infer violations from raw object counts: every person not matched by a
/// mask, hat or uniform detection is one violation of that type, and phones
/// and cigarettes count directly.
pub fn infer_from_class_numbers(class_numbers: &Value) -> Result<Breakdown> {
    let class_count = |name: &str| -> Result<i64> {
        match class_numbers.get(name).and_then(count_value) {
            Some(count) => Ok(bounded_count(name, count)?.max(0)),
            None => Ok(0),
        }
    };
    let persons = class_count("person")?;

    let mut breakdown = Breakdown::new();
    for protective in ["mask", "hat", "uniform"] {
        let missing = persons - class_count(protective)?;
        if missing > 0 {
            breakdown.insert(protective.to_string(), missing);
        }
    }
    for forbidden in ["phone", "cigarette"] {
        let seen = class_count(forbidden)?;
        if seen > 0 {
            breakdown.insert(forbidden.to_string(), seen);
        }
    }

    Ok(breakdown)
}
