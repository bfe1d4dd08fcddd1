//! Access code repository for database operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use domain::errors::StoreError;
use domain::models::{AccessCode, AnchorReceipt, CodeStats, CodeStatus, ScanPolicy};
use domain::services::{AccessCodeStore, Invalidation};

use crate::entities::{AccessCodeEntity, ACCESS_CODE_COLUMNS};
use crate::metrics::QueryTimer;

/// Unique index on token hashes.
pub const TOKEN_HASH_CONSTRAINT: &str = "access_codes_token_hash_key";

/// Partial unique index allowing one active code per registration.
pub const ONE_ACTIVE_CONSTRAINT: &str = "access_codes_one_active_per_registration";

/// Map a database error to the port error, recognizing the two uniqueness rules.
pub(crate) fn map_db_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err {
        // PostgreSQL error code 23505 = unique_violation
        if db_err.code().as_deref() == Some("23505") {
            match db_err.constraint() {
                Some(TOKEN_HASH_CONSTRAINT) => return StoreError::DuplicateToken,
                Some(ONE_ACTIVE_CONSTRAINT) => return StoreError::ActiveCodeExists,
                _ => {}
            }
        }
    }
    StoreError::Unavailable(err.to_string())
}

fn to_domain(entity: AccessCodeEntity) -> Result<AccessCode, StoreError> {
    let id = entity.id;
    entity.into_domain().map_err(|e| {
        warn!(code_id = %id, error = %e, "Corrupt access code row");
        StoreError::Unavailable(format!("corrupt access code row {}: {}", id, e))
    })
}

fn to_domain_opt(entity: Option<AccessCodeEntity>) -> Result<Option<AccessCode>, StoreError> {
    entity.map(to_domain).transpose()
}

/// Repository for access code database operations.
#[derive(Clone)]
pub struct AccessCodeRepository {
    pool: PgPool,
}

impl AccessCodeRepository {
    /// Creates a new AccessCodeRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_with<'e, E>(executor: E, code: &AccessCode) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO access_codes (
                id, registration_id, event_id, token_hash, status, scan_policy,
                issued_at, expires_at, usage_count, replaces_code_id, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(code.id)
        .bind(code.registration_id)
        .bind(code.event_id)
        .bind(&code.token_hash)
        .bind(code.status.as_str())
        .bind(code.scan_policy.as_str())
        .bind(code.issued_at)
        .bind(code.expires_at)
        .bind(code.usage_count)
        .bind(code.replaces_code_id)
        .bind(&code.metadata)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AccessCodeStore for AccessCodeRepository {
    async fn insert(&self, code: &AccessCode) -> Result<(), StoreError> {
        let timer = QueryTimer::new("insert_access_code");
        let result = Self::insert_with(&self.pool, code).await;
        timer.record();
        result.map_err(map_db_error)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AccessCode>, StoreError> {
        let timer = QueryTimer::new("find_access_code_by_id");
        let sql = format!("SELECT {} FROM access_codes WHERE id = $1", ACCESS_CODE_COLUMNS);
        let result = sqlx::query_as::<_, AccessCodeEntity>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await;
        timer.record();
        to_domain_opt(result.map_err(map_db_error)?)
    }

    async fn find_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AccessCode>, StoreError> {
        let timer = QueryTimer::new("find_access_code_by_token_hash");
        let sql = format!(
            "SELECT {} FROM access_codes WHERE token_hash = $1",
            ACCESS_CODE_COLUMNS
        );
        let result = sqlx::query_as::<_, AccessCodeEntity>(&sql)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await;
        timer.record();
        to_domain_opt(result.map_err(map_db_error)?)
    }

    async fn token_hash_exists(&self, token_hash: &str) -> Result<bool, StoreError> {
        let timer = QueryTimer::new("access_code_token_hash_exists");
        let result: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM access_codes WHERE token_hash = $1)")
                .bind(token_hash)
                .fetch_one(&self.pool)
                .await;
        timer.record();
        result.map_err(map_db_error)
    }

    async fn find_active_for_registration(
        &self,
        registration_id: i64,
    ) -> Result<Option<AccessCode>, StoreError> {
        let timer = QueryTimer::new("find_active_access_code");
        let sql = format!(
            "SELECT {} FROM access_codes WHERE registration_id = $1 AND status = 'active'",
            ACCESS_CODE_COLUMNS
        );
        let result = sqlx::query_as::<_, AccessCodeEntity>(&sql)
            .bind(registration_id)
            .fetch_optional(&self.pool)
            .await;
        timer.record();
        to_domain_opt(result.map_err(map_db_error)?)
    }

    async fn list_for_registration(
        &self,
        registration_id: i64,
    ) -> Result<Vec<AccessCode>, StoreError> {
        let timer = QueryTimer::new("list_access_codes_for_registration");
        let sql = format!(
            "SELECT {} FROM access_codes WHERE registration_id = $1 \
             ORDER BY issued_at DESC, id DESC",
            ACCESS_CODE_COLUMNS
        );
        let result = sqlx::query_as::<_, AccessCodeEntity>(&sql)
            .bind(registration_id)
            .fetch_all(&self.pool)
            .await;
        timer.record();
        result
            .map_err(map_db_error)?
            .into_iter()
            .map(to_domain)
            .collect()
    }

    async fn commit_scan(
        &self,
        id: Uuid,
        policy: ScanPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessCode>, StoreError> {
        let timer = QueryTimer::new("commit_access_code_scan");

        // Compare-and-swap: the WHERE clause re-checks the scan predicate
        // under the row lock taken by UPDATE.
        let sql = match policy {
            ScanPolicy::SingleUse => format!(
                r#"
                UPDATE access_codes
                SET status = 'used', usage_count = usage_count + 1, last_used_at = $2
                WHERE id = $1
                  AND status = 'active'
                  AND scan_policy = 'single_use'
                  AND usage_count = 0
                  AND expires_at > $2
                RETURNING {}
                "#,
                ACCESS_CODE_COLUMNS
            ),
            ScanPolicy::MultiUse => format!(
                r#"
                UPDATE access_codes
                SET usage_count = usage_count + 1, last_used_at = $2
                WHERE id = $1
                  AND status = 'active'
                  AND scan_policy = 'multi_use'
                  AND expires_at > $2
                RETURNING {}
                "#,
                ACCESS_CODE_COLUMNS
            ),
        };

        let result = sqlx::query_as::<_, AccessCodeEntity>(&sql)
            .bind(id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await;
        timer.record();
        to_domain_opt(result.map_err(map_db_error)?)
    }

    async fn mark_expired(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let timer = QueryTimer::new("mark_access_code_expired");
        let result = sqlx::query(
            r#"
            UPDATE access_codes
            SET status = 'expired'
            WHERE id = $1 AND status = 'active' AND expires_at <= $2
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await;
        timer.record();
        Ok(result.map_err(map_db_error)?.rows_affected() > 0)
    }

    async fn invalidate(
        &self,
        id: Uuid,
        invalidation: &Invalidation,
    ) -> Result<Option<AccessCode>, StoreError> {
        let timer = QueryTimer::new("invalidate_access_code");
        let sql = format!(
            r#"
            UPDATE access_codes
            SET status = 'invalidated', invalidation_reason = $2,
                invalidated_at = $3, invalidated_by = $4
            WHERE id = $1 AND status = 'active'
            RETURNING {}
            "#,
            ACCESS_CODE_COLUMNS
        );
        let result = sqlx::query_as::<_, AccessCodeEntity>(&sql)
            .bind(id)
            .bind(&invalidation.reason)
            .bind(invalidation.at)
            .bind(&invalidation.invalidated_by)
            .fetch_optional(&self.pool)
            .await;
        timer.record();
        to_domain_opt(result.map_err(map_db_error)?)
    }

    async fn replace_active(
        &self,
        old_id: Uuid,
        invalidation: &Invalidation,
        replacement: &AccessCode,
    ) -> Result<Option<AccessCode>, StoreError> {
        let timer = QueryTimer::new("replace_active_access_code");

        // Invalidate and insert in one transaction so the registration is
        // never left with zero or two active codes
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;

        let sql = format!(
            r#"
            UPDATE access_codes
            SET status = 'invalidated', invalidation_reason = $2,
                invalidated_at = $3, invalidated_by = $4
            WHERE id = $1 AND status = 'active'
            RETURNING {}
            "#,
            ACCESS_CODE_COLUMNS
        );
        let old = sqlx::query_as::<_, AccessCodeEntity>(&sql)
            .bind(old_id)
            .bind(&invalidation.reason)
            .bind(invalidation.at)
            .bind(&invalidation.invalidated_by)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_error)?;

        let Some(old) = old else {
            // Dropping the transaction rolls it back
            timer.record();
            return Ok(None);
        };

        Self::insert_with(&mut *tx, replacement)
            .await
            .map_err(map_db_error)?;
        tx.commit().await.map_err(map_db_error)?;

        timer.record();
        to_domain(old).map(Some)
    }

    async fn record_anchor(
        &self,
        id: Uuid,
        fingerprint: &str,
        receipt: &AnchorReceipt,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::new("record_access_code_anchor");
        let result = sqlx::query(
            "UPDATE access_codes \
             SET anchor_hash = $2, anchor_receipt = $3, anchored_at = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(fingerprint)
        .bind(&receipt.receipt_id)
        .bind(receipt.anchored_at)
        .execute(&self.pool)
        .await;
        timer.record();
        result.map_err(map_db_error)?;
        Ok(())
    }

    async fn list_unanchored(&self, limit: i64) -> Result<Vec<AccessCode>, StoreError> {
        let timer = QueryTimer::new("list_unanchored_access_codes");
        let sql = format!(
            "SELECT {} FROM access_codes \
             WHERE anchor_hash IS NULL AND status = 'active' \
             ORDER BY issued_at ASC LIMIT $1",
            ACCESS_CODE_COLUMNS
        );
        let result = sqlx::query_as::<_, AccessCodeEntity>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await;
        timer.record();
        result
            .map_err(map_db_error)?
            .into_iter()
            .map(to_domain)
            .collect()
    }

    async fn stats_for_event(
        &self,
        event_id: i64,
        now: DateTime<Utc>,
    ) -> Result<CodeStats, StoreError> {
        let timer = QueryTimer::new("access_code_stats_for_event");

        // Lazy expiry: stored 'active' rows past expiry count as expired
        let rows: Result<Vec<(String, i64)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT
                CASE WHEN status = 'active' AND expires_at <= $2 THEN 'expired' ELSE status END
                    AS effective_status,
                COUNT(*)::BIGINT AS total
            FROM access_codes
            WHERE event_id = $1
            GROUP BY effective_status
            "#,
        )
        .bind(event_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await;
        timer.record();

        let mut stats = CodeStats::default();
        for (status, count) in rows.map_err(map_db_error)? {
            match status.parse::<CodeStatus>() {
                Ok(CodeStatus::Active) => stats.active += count,
                Ok(CodeStatus::Used) => stats.used += count,
                Ok(CodeStatus::Expired) => stats.expired += count,
                Ok(CodeStatus::Invalidated) => stats.invalidated += count,
                Err(e) => warn!(event_id, error = %e, "Skipping unknown status in stats"),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_error_is_unavailable() {
        let err = map_db_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn test_row_not_found_is_unavailable() {
        let err = map_db_error(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
