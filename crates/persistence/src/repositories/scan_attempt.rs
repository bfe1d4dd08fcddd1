//! Scan attempt repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use domain::errors::StoreError;
use domain::models::ScanAttempt;
use domain::services::ScanAttemptLog;

use crate::entities::{ScanAttemptEntity, SCAN_ATTEMPT_COLUMNS};
use crate::metrics::QueryTimer;

use super::access_code::map_db_error;

pub(crate) fn to_domain(entity: ScanAttemptEntity) -> Result<ScanAttempt, StoreError> {
    let id = entity.id;
    entity.into_domain().map_err(|e| {
        warn!(attempt_id = %id, error = %e, "Corrupt scan attempt row");
        StoreError::Unavailable(format!("corrupt scan attempt row {}: {}", id, e))
    })
}

/// Repository for the append-only scan attempt log.
#[derive(Clone)]
pub struct ScanAttemptRepository {
    pool: PgPool,
}

impl ScanAttemptRepository {
    /// Creates a new ScanAttemptRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScanAttemptLog for ScanAttemptRepository {
    async fn append(&self, attempt: &ScanAttempt) -> Result<(), StoreError> {
        let timer = QueryTimer::new("insert_scan_attempt");
        let result = sqlx::query(
            r#"
            INSERT INTO scan_attempts (
                id, attempted_at, presented_token_hash, code_id, registration_id,
                event_id, access_point, device_info, location, outcome, reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.attempted_at)
        .bind(&attempt.presented_token_hash)
        .bind(attempt.code_id)
        .bind(attempt.registration_id)
        .bind(attempt.event_id)
        .bind(&attempt.access_point)
        .bind(&attempt.device_info)
        .bind(&attempt.location)
        .bind(attempt.outcome.as_str())
        .bind(attempt.outcome.reason().map(|r| r.as_str()))
        .execute(&self.pool)
        .await;
        timer.record();
        result.map_err(map_db_error)?;
        Ok(())
    }

    async fn list_for_code(
        &self,
        code_id: Uuid,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ScanAttempt>, StoreError> {
        let timer = QueryTimer::new("list_scan_attempts_for_code");

        // Keyset pagination on (attempted_at, id), newest first
        let result = match before {
            Some((at, id)) => {
                let sql = format!(
                    "SELECT {} FROM scan_attempts \
                     WHERE code_id = $1 AND (attempted_at, id) < ($2, $3) \
                     ORDER BY attempted_at DESC, id DESC LIMIT $4",
                    SCAN_ATTEMPT_COLUMNS
                );
                sqlx::query_as::<_, ScanAttemptEntity>(&sql)
                    .bind(code_id)
                    .bind(at)
                    .bind(id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM scan_attempts WHERE code_id = $1 \
                     ORDER BY attempted_at DESC, id DESC LIMIT $2",
                    SCAN_ATTEMPT_COLUMNS
                );
                sqlx::query_as::<_, ScanAttemptEntity>(&sql)
                    .bind(code_id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        };
        timer.record();

        result
            .map_err(map_db_error)?
            .into_iter()
            .map(to_domain)
            .collect()
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let timer = QueryTimer::new("purge_scan_attempts");
        let result = sqlx::query("DELETE FROM scan_attempts WHERE attempted_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await;
        timer.record();
        Ok(result.map_err(map_db_error)?.rows_affected())
    }
}
