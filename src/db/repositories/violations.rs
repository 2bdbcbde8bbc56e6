use crate::db::models::{
    NewViolation, StoreStatus, ViolationFilter, ViolationRecord, DEFAULT_STATUS,
};
use crate::db::repositories::ViolationStore;
use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, error};

const RECORD_COLUMNS: &str = "id, camera_id, detected_at, violation_data, total_violations, \
                              source_file, image_path, status, created_at";

/// Violations repository backed by PostgreSQL
#[derive(Clone)]
pub struct ViolationsRepository {
    pool: Arc<PgPool>,
}

impl ViolationsRepository {
    /// Create a new violations repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ViolationStore for ViolationsRepository {
    async fn insert(&self, violation: &NewViolation) -> Result<ViolationRecord> {
        let now = Utc::now();
        let violation_data = violation.violation_data(now).to_string();

        let sql = format!(
            r#"
            INSERT INTO violation_records (
                camera_id, detected_at, violation_data, total_violations,
                source_file, image_path, status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );

        let result = sqlx::query_as::<_, ViolationRecord>(&sql)
            .bind(&violation.camera_id)
            .bind(violation.detected_at)
            .bind(&violation_data)
            .bind(violation.total_violations)
            .bind(&violation.source_file)
            .bind(&violation.image_path)
            .bind(DEFAULT_STATUS)
            .bind(now)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to insert violation record: {}", e)))?;

        debug!("Inserted violation record {} for {}", result.id, result.camera_id);
        Ok(result)
    }

    async fn find_near_duplicate(
        &self,
        camera_id: &str,
        detected_at: DateTime<Utc>,
        total_violations: i64,
        tolerance: Duration,
    ) -> Result<Option<i64>> {
        let result = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM violation_records
            WHERE camera_id = $1
              AND total_violations = $2
              AND detected_at BETWEEN $3 AND $4
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(camera_id)
        .bind(total_violations)
        .bind(detected_at - tolerance)
        .bind(detected_at + tolerance)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to probe for duplicates: {}", e)))?;

        Ok(result)
    }

    async fn query(&self, filter: &ViolationFilter) -> Result<Vec<ViolationRecord>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM violation_records
            WHERE ($1::text IS NULL OR camera_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY detected_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
            RECORD_COLUMNS
        );

        let result = sqlx::query_as::<_, ViolationRecord>(&sql)
            .bind(&filter.camera_id)
            .bind(&filter.status)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to query violation records: {}", e)))?;

        Ok(result)
    }

    async fn count(&self, filter: &ViolationFilter) -> Result<i64> {
        let result = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM violation_records
            WHERE ($1::text IS NULL OR camera_id = $1)
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(&filter.camera_id)
        .bind(&filter.status)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to count violation records: {}", e)))?;

        Ok(result)
    }

    async fn fetch_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ViolationRecord>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM violation_records
            WHERE ($1::timestamptz IS NULL OR detected_at >= $1)
            ORDER BY detected_at DESC, id DESC
            "#,
            RECORD_COLUMNS
        );

        let result = sqlx::query_as::<_, ViolationRecord>(&sql)
            .bind(since)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to fetch violation window: {}", e)))?;

        Ok(result)
    }

    async fn status(&self) -> Result<StoreStatus> {
        let result = sqlx::query_as::<_, StoreStatus>(
            r#"
            SELECT
                COUNT(*) AS total_records,
                COALESCE(SUM(total_violations), 0)::BIGINT AS total_violations,
                COUNT(DISTINCT camera_id) AS unique_cameras,
                MIN(detected_at) AS earliest_detection,
                MAX(detected_at) AS latest_detection,
                MIN(created_at) AS earliest_created,
                MAX(created_at) AS latest_created
            FROM violation_records
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to read store status: {}", e)))?;

        Ok(result)
    }

    async fn bulk_clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM violation_records")
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to clear violation records: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&*self.pool).await {
            Ok(_) => Ok(true),
            Err(e) => {
                error!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}
