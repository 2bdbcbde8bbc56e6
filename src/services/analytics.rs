use crate::db::models::{Breakdown, ViolationRecord, ViolationView};
use crate::db::repositories::ViolationStore;
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Duration, Timelike, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

/// Number of newest records attached to an analytics report
pub const RECENT_RECORDS: usize = 10;

/// Named relative time range for analytics queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AggregationWindow {
    #[serde(rename = "1h")]
    LastHour,
    #[default]
    #[serde(rename = "24h")]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
    #[serde(rename = "all")]
    All,
}

impl AggregationWindow {
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::LastHour => Some(Duration::hours(1)),
            Self::LastDay => Some(Duration::hours(24)),
            Self::LastWeek => Some(Duration::days(7)),
            Self::LastMonth => Some(Duration::days(30)),
            Self::All => None,
        }
    }

    /// Earliest detection time inside the window, `None` for no bound
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.duration().map(|d| now - d)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastHour => "1h",
            Self::LastDay => "24h",
            Self::LastWeek => "7d",
            Self::LastMonth => "30d",
            Self::All => "all",
        }
    }
}

impl Display for AggregationWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationWindow {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1h" => Ok(Self::LastHour),
            "24h" => Ok(Self::LastDay),
            "7d" => Ok(Self::LastWeek),
            "30d" => Ok(Self::LastMonth),
            "all" => Ok(Self::All),
            other => Err(Error::Validation(format!(
                "Unknown time range '{}', expected one of 1h, 24h, 7d, 30d, all",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    /// max(parsed_violations, stored_violations)
    pub total_violations: i64,
    /// Sum of successfully parsed breakdowns
    pub parsed_violations: i64,
    /// Sum of the stored per-record totals
    pub stored_violations: i64,
    pub total_records: usize,
    pub active_cameras: usize,
    /// Records whose breakdown could not be read
    pub skipped_records: usize,
    pub query_timestamp: DateTime<Utc>,
}

/// Full breakdown of the violations in one window
#[derive(Debug, Clone, Serialize)]
pub struct ViolationAnalytics {
    pub time_range: AggregationWindow,
    pub summary: AnalyticsSummary,
    pub violations_by_type: Breakdown,
    pub violations_by_camera: Breakdown,
    /// Hour of day (UTC, 0-23)
    pub violations_by_hour: BTreeMap<u32, i64>,
    /// Calendar date (UTC, YYYY-MM-DD)
    pub violations_by_date: BTreeMap<String, i64>,
    pub recent_records: Vec<ViolationView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    pub total_records: i64,
    pub total_violations: i64,
    pub active_cameras: usize,
    pub avg_violations_per_record: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraStats {
    pub camera_id: String,
    pub records: i64,
    pub violations: i64,
    pub avg_violations: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViolationStats {
    pub time_range: AggregationWindow,
    pub summary: StatsSummary,
    /// Ordered by violations, highest first
    pub camera_breakdown: Vec<CameraStats>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn in_window(record: &ViolationRecord, since: Option<DateTime<Utc>>) -> bool {
    since.map_or(true, |since| record.detected_at >= since)
}

/// Aggregate `records` over `window` ending at `now`.
///
/// Records with an unreadable breakdown are left out of the type, hour and
/// date maps but still count towards the camera totals and the stored total.
/// The reported total is the larger of the parsed and stored sums.
pub fn aggregate(
    records: &[ViolationRecord],
    window: AggregationWindow,
    now: DateTime<Utc>,
) -> ViolationAnalytics {
    let since = window.since(now);
    let mut newest: Vec<&ViolationRecord> = records.iter().filter(|r| in_window(r, since)).collect();
    newest.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then_with(|| b.id.cmp(&a.id)));

    let mut violations_by_type = Breakdown::new();
    let mut violations_by_camera = Breakdown::new();
    let mut violations_by_hour = BTreeMap::new();
    let mut violations_by_date = BTreeMap::new();
    let mut parsed_violations: i64 = 0;
    let mut stored_violations: i64 = 0;
    let mut skipped_records = 0;

    for record in &newest {
        let total = record.total_violations;
        stored_violations = stored_violations.saturating_add(total);
        add_to(violations_by_camera.entry(record.camera_id.clone()).or_insert(0), total);

        let Some(breakdown) = record.breakdown() else {
            debug!("Record {} has an unreadable breakdown", record.id);
            skipped_records += 1;
            continue;
        };

        for (violation_type, count) in breakdown {
            parsed_violations = parsed_violations.saturating_add(count);
            add_to(violations_by_type.entry(violation_type).or_insert(0), count);
        }

        add_to(violations_by_hour.entry(record.detected_at.hour()).or_insert(0), total);
        add_to(
            violations_by_date
                .entry(record.detected_at.format("%Y-%m-%d").to_string())
                .or_insert(0),
            total,
        );
    }

    let recent_records = newest
        .iter()
        .take(RECENT_RECORDS)
        .map(|r| r.to_view())
        .collect();

    ViolationAnalytics {
        time_range: window,
        summary: AnalyticsSummary {
            total_violations: parsed_violations.max(stored_violations),
            parsed_violations,
            stored_violations,
            total_records: newest.len(),
            active_cameras: violations_by_camera.len(),
            skipped_records,
            query_timestamp: now,
        },
        violations_by_type,
        violations_by_camera,
        violations_by_hour,
        violations_by_date,
        recent_records,
    }
}

/// Counters saturate instead of wrapping on corrupt stored counts
fn add_to(counter: &mut i64, amount: i64) {
    *counter = counter.saturating_add(amount);
}

/// Record and violation counts per camera over `window`
pub fn summarize(
    records: &[ViolationRecord],
    window: AggregationWindow,
    now: DateTime<Utc>,
) -> ViolationStats {
    let since = window.since(now);
    let mut per_camera: BTreeMap<&str, (i64, i64)> = BTreeMap::new();

    for record in records.iter().filter(|r| in_window(r, since)) {
        let entry = per_camera.entry(record.camera_id.as_str()).or_insert((0, 0));
        entry.0 += 1;
        add_to(&mut entry.1, record.total_violations);
    }

    let mut camera_breakdown: Vec<CameraStats> = per_camera
        .into_iter()
        .map(|(camera_id, (records, violations))| CameraStats {
            camera_id: camera_id.to_string(),
            records,
            violations,
            avg_violations: round2(violations as f64 / records as f64),
        })
        .collect();
    camera_breakdown.sort_by(|a, b| b.violations.cmp(&a.violations));

    let total_records: i64 = camera_breakdown.iter().map(|c| c.records).sum();
    let total_violations = camera_breakdown
        .iter()
        .fold(0i64, |sum, c| sum.saturating_add(c.violations));

    ViolationStats {
        time_range: window,
        summary: StatsSummary {
            total_records,
            total_violations,
            active_cameras: camera_breakdown.len(),
            avg_violations_per_record: if total_records > 0 {
                round2(total_violations as f64 / total_records as f64)
            } else {
                0.0
            },
        },
        camera_breakdown,
    }
}

/// Answers windowed analytics questions against the store
pub struct AnalyticsService {
    store: Arc<dyn ViolationStore>,
}

impl AnalyticsService {
    pub fn new(store: Arc<dyn ViolationStore>) -> Self {
        Self { store }
    }

    pub async fn analytics(&self, window: AggregationWindow) -> Result<ViolationAnalytics> {
        let now = Utc::now();
        let records = self.store.fetch_since(window.since(now)).await?;
        let report = aggregate(&records, window, now);

        info!(
            "Analytics for {}: {} records, {} violations (parsed {}, stored {})",
            window,
            report.summary.total_records,
            report.summary.total_violations,
            report.summary.parsed_violations,
            report.summary.stored_violations
        );

        Ok(report)
    }

    pub async fn stats(&self, window: AggregationWindow) -> Result<ViolationStats> {
        let now = Utc::now();
        let records = self.store.fetch_since(window.since(now)).await?;
        Ok(summarize(&records, window, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::DEFAULT_STATUS;
    use crate::db::repositories::MemoryViolationStore;
    use chrono::TimeZone;

    fn record(id: i64, camera_id: &str, detected_at: DateTime<Utc>, data: &str, total: i64) -> ViolationRecord {
        ViolationRecord {
            id,
            camera_id: camera_id.to_string(),
            detected_at,
            violation_data: data.to_string(),
            total_violations: total,
            source_file: None,
            image_path: None,
            status: DEFAULT_STATUS.to_string(),
            created_at: detected_at,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 15, 30, 0).unwrap()
    }

    #[test]
    fn window_names_round_trip_and_unknown_is_rejected() {
        for name in ["1h", "24h", "7d", "30d", "all"] {
            assert_eq!(name.parse::<AggregationWindow>().unwrap().as_str(), name);
        }
        assert!(matches!(
            "2w".parse::<AggregationWindow>(),
            Err(Error::Validation(_))
        ));
        assert_eq!(AggregationWindow::All.since(now()), None);
        assert_eq!(AggregationWindow::default(), AggregationWindow::LastDay);
    }

    #[test]
    fn last_hour_excludes_older_events_and_all_includes_everything() {
        let records = vec![
            record(1, "cam_11", now() - Duration::minutes(10), r#"{"violations": {"mask": 2}}"#, 2),
            record(2, "cam_11", now() - Duration::minutes(61), r#"{"violations": {"hat": 5}}"#, 5),
            record(3, "cam_28", now() - Duration::days(400), r#"{"violations": {"phone": 1}}"#, 1),
        ];

        let hour = aggregate(&records, AggregationWindow::LastHour, now());
        assert_eq!(hour.summary.total_records, 1);
        assert_eq!(hour.summary.total_violations, 2);
        assert!(!hour.violations_by_type.contains_key("hat"));

        let all = aggregate(&records, AggregationWindow::All, now());
        assert_eq!(all.summary.total_records, 3);
        assert_eq!(all.summary.total_violations, 8);
        assert_eq!(all.summary.active_cameras, 2);
        assert_eq!(all.recent_records.first().map(|r| r.id), Some(1));
    }

    #[test]
    fn oversized_stored_counts_saturate() {
        let records = vec![
            record(1, "cam_11", now() - Duration::minutes(1), r#"{"violations": {"mask": 9223372036854775807}}"#, 1),
            record(2, "cam_11", now() - Duration::minutes(2), r#"{"violations": {"mask": 9223372036854775807}}"#, 1),
        ];

        let report = aggregate(&records, AggregationWindow::All, now());
        assert_eq!(report.summary.parsed_violations, i64::MAX);
        assert_eq!(report.violations_by_type["mask"], i64::MAX);
        assert_eq!(report.summary.stored_violations, 2);
    }

    #[test]
    fn corrupt_breakdowns_still_count_towards_totals() {
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 9, 5, 0).unwrap();
        let records = vec![
            record(1, "cam_11", at, r#"{"violations": {"mask": 2, "hat": 1}}"#, 3),
            record(2, "cam_11", at, "[object Object]", 4),
            record(3, "cam_34", at, r#"{"total_violations": 6}"#, 6),
        ];

        let report = aggregate(&records, AggregationWindow::All, now());
        assert_eq!(report.summary.parsed_violations, 3);
        assert_eq!(report.summary.stored_violations, 13);
        assert_eq!(report.summary.total_violations, 13);
        assert_eq!(report.summary.skipped_records, 2);
        assert_eq!(report.violations_by_camera["cam_11"], 7);
        assert_eq!(report.violations_by_camera["cam_34"], 6);
        assert_eq!(report.violations_by_type.values().sum::<i64>(), 3);
        assert_eq!(report.violations_by_hour.get(&9), Some(&3));
        assert_eq!(report.violations_by_date.get("2024-03-10"), Some(&3));
    }

    #[test]
    fn reconciled_total_never_drops_below_stored_total() {
        // breakdown larger than the stored total wins as well
        let at = now() - Duration::minutes(5);
        let records = vec![
            record(1, "cam_11", at, r#"{"violations": {"mask": 9}}"#, 2),
            record(2, "cam_11", at, "not json", 1),
        ];
        let report = aggregate(&records, AggregationWindow::LastHour, now());
        assert_eq!(report.summary.total_violations, 9);
        assert!(report.summary.total_violations >= report.summary.stored_violations);
    }

    #[test]
    fn recent_records_are_capped() {
        let records: Vec<ViolationRecord> = (0..15)
            .map(|i| record(i, "cam_11", now() - Duration::minutes(i), r#"{"violations": {"mask": 1}}"#, 1))
            .collect();
        let report = aggregate(&records, AggregationWindow::LastDay, now());
        assert_eq!(report.recent_records.len(), RECENT_RECORDS);
        assert_eq!(report.recent_records[0].id, 0);
    }

    #[test]
    fn stats_group_by_camera_with_rounded_averages() {
        let at = now() - Duration::hours(2);
        let records = vec![
            record(1, "cam_11", at, "{}", 1),
            record(2, "cam_11", at, "{}", 2),
            record(3, "cam_11", at, "{}", 2),
            record(4, "cam_28", at, "{}", 9),
            record(5, "cam_34", now() - Duration::days(2), "{}", 50),
        ];

        let stats = summarize(&records, AggregationWindow::LastDay, now());
        assert_eq!(stats.summary.total_records, 4);
        assert_eq!(stats.summary.total_violations, 14);
        assert_eq!(stats.summary.active_cameras, 2);
        assert_eq!(stats.summary.avg_violations_per_record, 3.5);
        assert_eq!(stats.camera_breakdown[0].camera_id, "cam_28");
        assert_eq!(stats.camera_breakdown[1].avg_violations, 1.67);

        let empty = summarize(&[], AggregationWindow::All, now());
        assert_eq!(empty.summary.avg_violations_per_record, 0.0);
    }

    #[tokio::test]
    async fn service_reads_the_window_from_the_store() -> Result<()> {
        let store = Arc::new(MemoryViolationStore::new());
        store
            .insert_raw("cam_11", Utc::now() - Duration::minutes(5), r#"{"violations": {"mask": 1}}"#, 1)
            .await;
        store
            .insert_raw("cam_11", Utc::now() - Duration::days(3), r#"{"violations": {"hat": 4}}"#, 4)
            .await;
        let service = AnalyticsService::new(store);

        assert_eq!(service.analytics(AggregationWindow::LastDay).await?.summary.total_violations, 1);
        assert_eq!(service.analytics(AggregationWindow::All).await?.summary.total_violations, 5);
        assert_eq!(service.stats(AggregationWindow::LastWeek).await?.summary.total_records, 2);
        Ok(())
    }
}
