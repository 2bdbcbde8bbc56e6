use crate::config::IngestConfig;
use crate::db::models::Breakdown;
use crate::error::Error;
use crate::ingest::dedup::SeenHashes;
use crate::ingest::normalizer::{normalize_bytes, Provenance};
use crate::ingest::pipeline::{RecordOutcome, ViolationPipeline};
use crate::messaging::ViolationEvents;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const SOURCE_LABEL: &str = "ingest";

/// Running totals reported by the processor status endpoint
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherStats {
    pub processed_files: usize,
    pub processed_hashes: usize,
    pub total_violations: i64,
    pub violations_by_type: Breakdown,
    pub violations_by_camera: Breakdown,
    pub duplicates_skipped: u64,
    pub failed_files: u64,
    pub is_processing: bool,
    pub is_running: bool,
    pub last_check: Option<DateTime<Utc>>,
}

/// Summary of one scan of the drop directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub discovered: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// The previous tick was still running, nothing was done
    pub skipped_busy: bool,
}

/// File counts of the detector's output directories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DropDirSummary {
    pub json_count: usize,
    pub images_count: usize,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Outcome for a single drop file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Inserted { record_id: i64 },
    Duplicate { existing_id: i64 },
    /// Unreadable or not a detection record; marked processed, never retried
    Malformed { reason: String },
    /// Left unmarked so the next tick retries it
    StorageFailed { reason: String },
    AlreadyProcessed,
}

/// Caches owned by the watcher: file names handled in this process and the
/// dedup keys of everything they produced
#[derive(Default)]
struct WatcherState {
    processed_files: HashSet<String>,
    seen: SeenHashes,
}

struct LoopControl {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Clears the busy flag when a tick ends, even by panic
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Polls the drop directory and feeds new detection files through the pipeline
pub struct IngestWatcher {
    config: IngestConfig,
    pipeline: Arc<ViolationPipeline>,
    events: Option<Arc<ViolationEvents>>,
    state: Mutex<WatcherState>,
    stats: RwLock<WatcherStats>,
    is_processing: AtomicBool,
    control: Mutex<Option<LoopControl>>,
}

impl IngestWatcher {
    pub fn new(config: IngestConfig, pipeline: Arc<ViolationPipeline>) -> Self {
        Self {
            config,
            pipeline,
            events: None,
            state: Mutex::new(WatcherState::default()),
            stats: RwLock::new(WatcherStats::default()),
            is_processing: AtomicBool::new(false),
            control: Mutex::new(None),
        }
    }

    /// Publish processor lifecycle events to the broker
    pub fn with_events(mut self, events: Arc<ViolationEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn drop_dir(&self) -> &Path {
        &self.config.drop_dir
    }

    /// Start polling in the background. Returns false if already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut control = self.control.lock().await;
        if control.is_some() {
            debug!("Ingestion watcher already running");
            return false;
        }

        let poll_secs = self.config.poll_interval_secs.max(1);
        info!(
            "Starting ingestion watcher on {} every {} seconds",
            self.config.drop_dir.display(),
            poll_secs
        );

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let watcher = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(poll_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        info!("Ingestion watcher loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        // A panicking tick must not take the loop down with it
                        let tick = Arc::clone(&watcher);
                        match tokio::spawn(async move { tick.process_now().await }).await {
                            Ok(report) if report.discovered > 0 => {
                                debug!("Ingestion tick: {:?}", report)
                            }
                            Ok(_) => {}
                            Err(e) => error!("Ingestion tick aborted: {}", e),
                        }
                    }
                }
            }
        });

        *control = Some(LoopControl { cancel, handle });
        self.stats.write().await.is_running = true;
        drop(control);

        if let Some(events) = &self.events {
            if let Err(e) = events
                .processor_started(&self.config.drop_dir, poll_secs)
                .await
            {
                warn!("Failed to publish processor started event: {}", e);
            }
        }

        true
    }

    /// Stop polling. An in-flight tick finishes before this returns.
    pub async fn stop(&self) -> Result<()> {
        let control = self.control.lock().await.take();
        let Some(control) = control else {
            return Ok(());
        };

        control.cancel.cancel();
        control
            .handle
            .await
            .map_err(|e| Error::Internal(format!("Ingestion watcher task failed: {}", e)))?;

        let processed_files = {
            let mut stats = self.stats.write().await;
            stats.is_running = false;
            stats.processed_files
        };
        info!("Ingestion watcher stopped after {} files", processed_files);

        if let Some(events) = &self.events {
            if let Err(e) = events.processor_stopped(processed_files).await {
                warn!("Failed to publish processor stopped event: {}", e);
            }
        }

        Ok(())
    }

    /// Claim the processing flag, or None while another run holds it
    fn try_begin(&self) -> Option<BusyGuard<'_>> {
        self.is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(&self.is_processing))
    }

    /// Scan the drop directory once. Skipped entirely while another scan runs.
    pub async fn process_now(&self) -> TickReport {
        let Some(_busy) = self.try_begin() else {
            debug!("Previous ingestion tick still running, skipping");
            return TickReport {
                skipped_busy: true,
                ..TickReport::default()
            };
        };

        let mut report = TickReport::default();
        let mut state = self.state.lock().await;

        match self.list_new_files(&state).await {
            Ok(files) => {
                report.discovered = files.len();
                if !files.is_empty() {
                    info!(
                        "Found {} new detection files in {}",
                        files.len(),
                        self.config.drop_dir.display()
                    );
                }

                for file_name in files {
                    match self.process_entry(&mut state, &file_name).await {
                        FileOutcome::Inserted { .. } => report.inserted += 1,
                        FileOutcome::Duplicate { .. } => report.duplicates += 1,
                        FileOutcome::Malformed { .. } | FileOutcome::StorageFailed { .. } => {
                            report.failed += 1
                        }
                        FileOutcome::AlreadyProcessed => {}
                    }
                }
            }
            Err(e) => error!(
                "Failed to scan drop directory {}: {}",
                self.config.drop_dir.display(),
                e
            ),
        }

        self.stats.write().await.last_check = Some(Utc::now());
        report
    }

    /// Process one named file from the drop directory on demand
    pub async fn process_file(&self, file_name: &str) -> Result<FileOutcome> {
        let is_plain_name = Path::new(file_name)
            .file_name()
            .map_or(false, |name| name == file_name);
        if !is_plain_name {
            return Err(Error::Validation(format!("Invalid file name: {}", file_name)).into());
        }

        let Some(_busy) = self.try_begin() else {
            return Err(Error::Busy("A drop directory scan is in progress".to_string()).into());
        };

        let mut state = self.state.lock().await;
        if state.processed_files.contains(file_name) {
            return Ok(FileOutcome::AlreadyProcessed);
        }

        let path = self.config.drop_dir.join(file_name);
        if !is_regular_file(&path).await {
            return Err(Error::NotFound(format!("No such drop file: {}", file_name)).into());
        }

        Ok(self.process_entry(&mut state, file_name).await)
    }

    /// Forget processed files and dedup keys; stored records are untouched
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.processed_files.clear();
        state.seen.clear();

        let mut stats = self.stats.write().await;
        stats.processed_files = 0;
        stats.processed_hashes = 0;
        info!("Ingestion watcher state reset");
    }

    /// Drop cached dedup keys, used after the store was cleared
    pub async fn forget_hashes(&self) {
        let mut state = self.state.lock().await;
        state.seen.clear();
        self.stats.write().await.processed_hashes = 0;
    }

    /// Count pending-or-processed drop files and detector images on disk
    pub async fn drop_dir_summary(&self) -> DropDirSummary {
        let extension = self.config.file_extension.to_lowercase();
        DropDirSummary {
            json_count: count_files(&self.config.drop_dir, &[extension.as_str()]).await,
            images_count: count_files(&self.config.image_dir, IMAGE_EXTENSIONS).await,
        }
    }

    pub async fn get_stats(&self) -> WatcherStats {
        let mut stats = self.stats.read().await.clone();
        stats.is_processing = self.is_processing.load(Ordering::Acquire);
        stats
    }

    /// Names of matching files not yet processed, in directory order
    async fn list_new_files(&self, state: &WatcherState) -> Result<Vec<String>> {
        let dir = &self.config.drop_dir;
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Io(format!("Failed to create {}: {}", dir.display(), e)))?;
            info!("Created drop directory {}", dir.display());
        }

        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            self.config.file_extension
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("Invalid drop file pattern {}: {}", pattern, e)))?;

        let mut files = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => {
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if !state.processed_files.contains(name) && is_regular_file(&path).await {
                        files.push(name.to_string());
                    }
                }
                Err(e) => warn!("Unreadable drop directory entry: {}", e),
            }
        }

        Ok(files)
    }

    /// Read, normalize, dedup and store one file. Failures stay local to the file.
    async fn process_entry(&self, state: &mut WatcherState, file_name: &str) -> FileOutcome {
        let path = self.config.drop_dir.join(file_name);

        let parsed = match tokio::fs::read(&path).await {
            Ok(bytes) => normalize_bytes(
                &bytes,
                Provenance {
                    label: SOURCE_LABEL,
                    file_name: Some(file_name),
                    received_at: Utc::now(),
                },
            ),
            Err(e) => Err(Error::MalformedInput(format!("unreadable file: {}", e)).into()),
        };

        let event = match parsed {
            Ok(event) => event,
            Err(e) => {
                error!("Skipping malformed detection file {}: {}", file_name, e);
                state.processed_files.insert(file_name.to_string());
                self.bump_failed(state).await;
                return FileOutcome::Malformed {
                    reason: e.to_string(),
                };
            }
        };

        match self.pipeline.record(&event, Some(&mut state.seen)).await {
            Ok(outcome) => {
                state.processed_files.insert(file_name.to_string());

                let mut stats = self.stats.write().await;
                stats.processed_files = state.processed_files.len();
                stats.processed_hashes = state.seen.len();

                match outcome {
                    RecordOutcome::Inserted(record) => {
                        stats.total_violations =
                            stats.total_violations.saturating_add(event.total_violations);
                        for (violation_type, count) in &event.violations {
                            let entry = stats
                                .violations_by_type
                                .entry(violation_type.clone())
                                .or_insert(0);
                            *entry = entry.saturating_add(*count);
                        }
                        let entry = stats
                            .violations_by_camera
                            .entry(event.camera_id.clone())
                            .or_insert(0);
                        *entry = entry.saturating_add(event.total_violations);

                        info!("Processed {} as record {}", file_name, record.id);
                        FileOutcome::Inserted {
                            record_id: record.id,
                        }
                    }
                    RecordOutcome::Duplicate { existing_id } => {
                        stats.duplicates_skipped += 1;
                        info!("Skipped {}: duplicate of record {}", file_name, existing_id);
                        FileOutcome::Duplicate { existing_id }
                    }
                }
            }
            Err(e) => {
                warn!("Failed to store {} (will retry): {}", file_name, e);
                self.bump_failed(state).await;
                FileOutcome::StorageFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn bump_failed(&self, state: &WatcherState) {
        let mut stats = self.stats.write().await;
        stats.failed_files += 1;
        stats.processed_files = state.processed_files.len();
    }
}

/// Regular files in `dir` with one of `extensions` (case-insensitive); a
/// missing directory counts as empty
async fn count_files(dir: &Path, extensions: &[&str]) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot list {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut count = 0;
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                let matches = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| {
                        extensions.iter().any(|want| ext.eq_ignore_ascii_case(want))
                    });
                if matches && is_regular_file(&path).await {
                    count += 1;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read entry in {}: {}", dir.display(), e);
                break;
            }
        }
    }
    count
}

async fn is_regular_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}
