use crate::api::websocket::{ws_all_violations, ws_camera_violations};
use crate::config::{ApiConfig, LiveConfig};
use crate::db::models::{ViolationFilter, ViolationView};
use crate::db::repositories::ViolationStore;
use crate::error::Error;
use crate::ingest::watcher::IngestWatcher;
use crate::messaging::{LiveHub, ViolationEvents};
use crate::services::analytics::{AggregationWindow, AnalyticsService};
use crate::services::submission::{SubmissionService, ViolationSubmission};
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Upper bound for a single page of records
const MAX_PAGE_SIZE: i64 = 500;

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ViolationStore>,
    pub analytics: Arc<AnalyticsService>,
    pub submissions: Arc<SubmissionService>,
    pub watcher: Arc<IngestWatcher>,
    pub hub: LiveHub,
    pub events: Option<Arc<ViolationEvents>>,
    pub live: LiveConfig,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            ref e if e.is_input_error() => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Busy(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            message: err.to_string(),
            status: status.as_u16(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(err) = err.downcast_ref::<Error>() {
            return (*err).clone().into();
        }

        ApiError {
            message: err.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "success": false,
            "message": self.message,
            "status": self.status,
        }));
        (status, body).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub camera_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeParams {
    pub range: Option<String>,
    /// `all=true` ignores `range`
    pub all: Option<bool>,
}

impl RangeParams {
    fn window(&self) -> std::result::Result<AggregationWindow, Error> {
        if self.all.unwrap_or(false) {
            return Ok(AggregationWindow::All);
        }
        match self.range.as_deref() {
            Some(range) => range.parse(),
            None => Ok(AggregationWindow::default()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessRequest {
    #[serde(alias = "file_name")]
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub current_page: i64,
    pub per_page: i64,
    pub total: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct ViolationPage {
    pub records: Vec<ViolationView>,
    pub pagination: Pagination,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_credentials(false)
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/api/health", get(health))
        // Violation routes
        .route("/api/violations/save", post(save_violation))
        .route("/api/violations/list", get(list_violations))
        .route("/api/violations/stats", get(violation_stats))
        .route("/api/violations/analytics", get(violation_analytics))
        .route("/api/violations/status", get(store_status))
        .route("/api/violations/clear", post(clear_violations))
        // Processor routes
        .route("/api/processor/status", get(processor_status))
        .route("/api/processor/process", post(processor_process))
        .route("/api/processor/reset", post(processor_reset))
        // Live channel
        .route("/ws/violations", get(ws_all_violations))
        .route("/ws/violations/:camera_id", get(ws_camera_violations))
        .with_state(state)
        .layer(cors)
}

pub struct RestApi {
    config: ApiConfig,
    state: AppState,
}

impl RestApi {
    pub fn new(config: &ApiConfig, state: AppState) -> Self {
        Self {
            config: config.clone(),
            state,
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let app = router(self.state);

        let addr = format!("{}:{}", self.config.address, self.config.port);
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid API address {}: {}", addr, e)))?;

        let listener = TcpListener::bind(addr).await?;
        info!("API server listening on {}", addr);

        axum::Server::from_tcp(listener.into_std()?)?
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let database = match state.store.health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!("Database health check failed: {}", e);
            false
        }
    };
    let processor = state.watcher.get_stats().await;

    Json(json!({
        "success": true,
        "status": if database { "ok" } else { "degraded" },
        "database": database,
        "processor_running": processor.is_running,
        "live_subscribers": state.hub.subscriber_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn save_violation(
    State(state): State<AppState>,
    Json(submission): Json<ViolationSubmission>,
) -> ApiResult<Json<Value>> {
    let receipt = state.submissions.submit(&submission).await?;

    let message = if receipt.duplicate {
        "Violation already recorded"
    } else {
        "Violation recorded"
    };

    Ok(Json(json!({
        "success": true,
        "message": message,
        "record_id": receipt.record_id,
        "duplicate": receipt.duplicate,
    })))
}

pub async fn list_violations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Value>> {
    let page = params.page.filter(|p| *p > 0).unwrap_or(1);
    let limit = params
        .limit
        .filter(|l| *l > 0)
        .unwrap_or(state.live.default_list_limit)
        .min(MAX_PAGE_SIZE);

    let offset = (page - 1)
        .checked_mul(limit)
        .ok_or_else(|| Error::Validation(format!("page {} is out of range", page)))?;

    let filter = ViolationFilter {
        camera_id: params.camera_id.filter(|c| !c.is_empty()),
        status: params.status.filter(|s| !s.is_empty()),
        limit,
        offset,
    };

    let records = state.store.query(&filter).await?;
    let total = state.store.count(&filter).await?;

    let body = ViolationPage {
        records: records.iter().map(|r| r.to_view()).collect(),
        pagination: Pagination {
            current_page: page,
            per_page: limit,
            total,
            total_pages: total / limit + i64::from(total % limit != 0),
        },
    };

    Ok(Json(json!({ "success": true, "data": body })))
}

pub async fn violation_stats(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<Value>> {
    let stats = state.analytics.stats(params.window()?).await?;
    Ok(Json(json!({ "success": true, "data": stats })))
}

pub async fn violation_analytics(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<Value>> {
    let report = state.analytics.analytics(params.window()?).await?;
    Ok(Json(json!({ "success": true, "data": report })))
}

pub async fn store_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let status = state.store.status().await?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "total_records": status.total_records,
            "total_violations": status.total_violations,
            "unique_cameras": status.unique_cameras,
            "time_range": {
                "detected_at": {
                    "earliest": status.earliest_detection,
                    "latest": status.latest_detection,
                },
                "created_at": {
                    "earliest": status.earliest_created,
                    "latest": status.latest_created,
                },
            },
            "current_time": chrono::Utc::now().to_rfc3339(),
        },
    })))
}

pub async fn clear_violations(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let cleared = state.store.bulk_clear().await?;
    state.watcher.forget_hashes().await;
    info!("Cleared {} violation records", cleared);

    if let Some(events) = &state.events {
        if let Err(e) = events.violations_cleared(cleared).await {
            warn!("Failed to publish violations cleared event: {}", e);
        }
    }

    Ok(Json(json!({
        "success": true,
        "message": format!("Cleared {} violation records", cleared),
        "cleared_records": cleared,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

pub async fn processor_status(State(state): State<AppState>) -> Json<Value> {
    let stats = state.watcher.get_stats().await;
    let output = state.watcher.drop_dir_summary().await;
    Json(json!({
        "success": true,
        "drop_dir": state.watcher.drop_dir().display().to_string(),
        "batch_output_status": {
            "images_count": output.images_count,
            "json_count": output.json_count,
            "processed_files": stats.processed_files,
            "is_processing": stats.is_processing,
            "last_check": stats.last_check,
        },
        "stats": stats,
    }))
}

pub async fn processor_process(
    State(state): State<AppState>,
    request: Option<Json<ProcessRequest>>,
) -> ApiResult<Json<Value>> {
    let filename = request
        .and_then(|Json(request)| request.filename)
        .filter(|f| !f.is_empty());

    match filename {
        Some(filename) => {
            let outcome = state.watcher.process_file(&filename).await?;
            Ok(Json(json!({
                "success": true,
                "filename": filename,
                "result": outcome,
            })))
        }
        None => {
            let report = state.watcher.process_now().await;
            Ok(Json(json!({ "success": true, "report": report })))
        }
    }
}

pub async fn processor_reset(State(state): State<AppState>) -> Json<Value> {
    state.watcher.reset().await;
    Json(json!({
        "success": true,
        "message": "Processor state reset",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::db::repositories::MemoryViolationStore;
    use crate::ingest::pipeline::ViolationPipeline;
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    fn state(store: Arc<MemoryViolationStore>, drop_dir: &TempDir) -> AppState {
        let hub = LiveHub::new(16);
        let pipeline = Arc::new(ViolationPipeline::new(
            store.clone(),
            ChronoDuration::seconds(2),
            hub.clone(),
        ));
        let ingest = IngestConfig {
            drop_dir: drop_dir.path().to_path_buf(),
            image_dir: drop_dir.path().join("images"),
            ..IngestConfig::default()
        };

        AppState {
            store: store.clone(),
            analytics: Arc::new(AnalyticsService::new(store)),
            submissions: Arc::new(SubmissionService::new(pipeline.clone())),
            watcher: Arc::new(IngestWatcher::new(ingest, pipeline)),
            hub,
            events: None,
            live: LiveConfig::default(),
        }
    }

    async fn seed(store: &MemoryViolationStore, camera_id: &str, count: i64) {
        for i in 0..count {
            store
                .insert_raw(
                    camera_id,
                    Utc::now() - ChronoDuration::minutes(i),
                    r#"{"violations": {"mask": 1}}"#,
                    1,
                )
                .await;
        }
    }

    #[tokio::test]
    async fn list_paginates_with_camera_filter() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryViolationStore::new());
        seed(&store, "cam_11", 5).await;
        seed(&store, "cam_28", 2).await;

        let params = ListParams {
            page: Some(2),
            limit: Some(2),
            camera_id: Some("cam_11".to_string()),
            status: None,
        };
        let Json(body) = list_violations(State(state(store, &dir)), Query(params))
            .await
            .unwrap();

        assert_eq!(body["data"]["records"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"]["pagination"]["total"], 5);
        assert_eq!(body["data"]["pagination"]["total_pages"], 3);
        assert_eq!(body["data"]["pagination"]["current_page"], 2);
    }

    #[tokio::test]
    async fn pages_beyond_the_end_are_empty_or_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryViolationStore::new());
        seed(&store, "cam_11", 3).await;
        let state = state(store, &dir);

        let far = ListParams {
            page: Some(1_000_000),
            limit: Some(10),
            ..ListParams::default()
        };
        let Json(body) = list_violations(State(state.clone()), Query(far))
            .await
            .unwrap();
        assert_eq!(body["data"]["records"].as_array().unwrap().len(), 0);
        assert_eq!(body["data"]["pagination"]["total_pages"], 1);

        let overflowing = ListParams {
            page: Some(i64::MAX),
            limit: Some(10),
            ..ListParams::default()
        };
        let err = list_violations(State(state), Query(overflowing))
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[tokio::test]
    async fn clear_reports_removed_records_and_list_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryViolationStore::new());
        seed(&store, "cam_34", 42).await;
        let state = state(store, &dir);

        let Json(cleared) = clear_violations(State(state.clone())).await.unwrap();
        assert_eq!(cleared["cleared_records"], 42);

        let Json(listed) = list_violations(State(state), Query(ListParams::default()))
            .await
            .unwrap();
        assert_eq!(listed["data"]["records"].as_array().unwrap().len(), 0);
        assert_eq!(listed["data"]["pagination"]["total"], 0);
    }

    #[tokio::test]
    async fn duplicate_submission_returns_original_id() {
        let dir = TempDir::new().unwrap();
        let state = state(Arc::new(MemoryViolationStore::new()), &dir);
        let submission: ViolationSubmission = serde_json::from_value(json!({
            "camera_id": "cam_11",
            "detection_timestamp": "2024-01-01T12:00:00Z",
            "violation_data": "{\"violations\": {\"mask\": 2, \"hat\": 1}}",
            "total_violations": 3
        }))
        .unwrap();

        let Json(first) = save_violation(State(state.clone()), Json(submission.clone()))
            .await
            .unwrap();
        let Json(second) = save_violation(State(state), Json(submission)).await.unwrap();

        assert_eq!(first["duplicate"], false);
        assert_eq!(second["duplicate"], true);
        assert_eq!(second["record_id"], first["record_id"]);
    }

    #[tokio::test]
    async fn bad_input_maps_to_bad_request() {
        let dir = TempDir::new().unwrap();
        let state = state(Arc::new(MemoryViolationStore::new()), &dir);

        let submission: ViolationSubmission = serde_json::from_value(json!({
            "camera_id": "cam_11",
            "detection_timestamp": "2024-01-01T12:00:00Z",
            "violation_data": "[object Object]"
        }))
        .unwrap();
        let err = save_violation(State(state.clone()), Json(submission))
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);

        let params = RangeParams {
            range: Some("fortnight".to_string()),
            all: None,
        };
        let err = violation_analytics(State(state), Query(params)).await.unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[tokio::test]
    async fn analytics_all_flag_overrides_range() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryViolationStore::new());
        store
            .insert_raw("cam_11", Utc::now() - ChronoDuration::days(90), r#"{"violations": {"hat": 2}}"#, 2)
            .await;
        let state = state(store, &dir);

        let params = RangeParams {
            range: Some("1h".to_string()),
            all: Some(true),
        };
        let Json(body) = violation_analytics(State(state), Query(params)).await.unwrap();
        assert_eq!(body["data"]["summary"]["total_violations"], 2);
        assert_eq!(body["data"]["time_range"], "all");
    }

    #[tokio::test]
    async fn processor_endpoints_drive_the_watcher() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("D11_a.json"),
            r#"{"violations": {"mask": 2, "hat": 1}}"#,
        )
        .unwrap();
        let state = state(Arc::new(MemoryViolationStore::new()), &dir);

        let Json(body) = processor_process(
            State(state.clone()),
            Some(Json(ProcessRequest {
                filename: Some("D11_a.json".to_string()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(body["result"]["outcome"], "inserted");

        let Json(status) = processor_status(State(state.clone())).await;
        assert_eq!(status["stats"]["processedFiles"], 1);
        assert_eq!(status["stats"]["violationsByCamera"]["cam_11"], 3);
        assert_eq!(status["batch_output_status"]["json_count"], 1);
        assert_eq!(status["batch_output_status"]["processed_files"], 1);
        assert_eq!(status["batch_output_status"]["is_processing"], false);

        let err = processor_process(
            State(state.clone()),
            Some(Json(ProcessRequest {
                filename: Some("missing.json".to_string()),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, 404);

        processor_reset(State(state.clone())).await;
        let Json(body) = processor_process(State(state), None).await.unwrap();
        assert_eq!(body["report"]["duplicates"], 1);
    }
}
