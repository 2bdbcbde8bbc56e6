use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// "2024年01月01日 星期一 12:00:00" style timestamps written by the detector
static LOCALIZED_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4})年(\d{1,2})月(\d{1,2})日.*?(\d{1,2}):(\d{2}):(\d{2})")
        .expect("localized timestamp pattern is valid")
});

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

/// Epoch values above this are taken as milliseconds
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Parse a detection timestamp from a raw JSON value.
///
/// Accepts RFC 3339 strings, naive date-times (read as local time), the
/// localized `YYYY年MM月DD日 ... HH:MM:SS` form and epoch seconds or
/// milliseconds. The result is truncated to whole seconds.
pub fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    let parsed = match value {
        serde_json::Value::String(s) => parse_timestamp_str(s),
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        _ => None,
    }?;

    truncate_to_seconds(parsed)
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if raw.contains('年') {
        return parse_localized(raw);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    if raw.chars().all(|c| c.is_ascii_digit()) {
        return raw.parse::<i64>().ok().and_then(from_epoch);
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(local_to_utc)
}

fn parse_localized(raw: &str) -> Option<DateTime<Utc>> {
    let caps = LOCALIZED_TIMESTAMP.captures(raw)?;
    let field = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, field(2)?, field(3)?)?
        .and_hms_opt(field(4)?, field(5)?, field(6)?)?;

    local_to_utc(naive)
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value <= 0 {
        return None;
    }
    if value >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

pub fn truncate_to_seconds(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(dt.timestamp(), 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        local_to_utc(
            NaiveDate::from_ymd_opt(y, mo, d)
                .unwrap()
                .and_hms_opt(h, mi, s)
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn rfc3339_is_truncated_to_seconds() {
        let parsed = parse_timestamp(&json!("2024-01-01T12:00:00.750Z")).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn localized_form_is_read_as_local_time() {
        let parsed = parse_timestamp(&json!("2024年03月05日 星期二 08:15:30")).unwrap();
        assert_eq!(parsed, local(2024, 3, 5, 8, 15, 30));
    }

    #[test]
    fn naive_and_epoch_forms() {
        assert_eq!(
            parse_timestamp(&json!("2024-01-01 12:00:00")).unwrap(),
            local(2024, 1, 1, 12, 0, 0)
        );
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(&json!(1704067200)).unwrap(), expected);
        assert_eq!(parse_timestamp(&json!(1704067200123_i64)).unwrap(), expected);
        assert_eq!(parse_timestamp(&json!("1704067200")).unwrap(), expected);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_timestamp(&json!("yesterday-ish")).is_none());
        assert!(parse_timestamp(&json!("2024年13月40日 25:00:00")).is_none());
        assert!(parse_timestamp(&json!(null)).is_none());
        assert!(parse_timestamp(&json!({"t": 1})).is_none());
        assert!(parse_timestamp(&json!("")).is_none());
    }
}
