//! Registration read model and attendance sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use domain::errors::StoreError;
use domain::models::ScanAttempt;
use domain::services::{AttendanceRecorder, EventBinding, RegistrationDirectory};

use crate::entities::{ScanAttemptEntity, SCAN_ATTEMPT_COLUMNS};
use crate::metrics::QueryTimer;

use super::access_code::map_db_error;
use super::scan_attempt::to_domain;

/// Registration status that allows issuing codes.
pub const APPROVED_STATUS: &str = "approved";

#[derive(Debug, sqlx::FromRow)]
struct RegistrationRow {
    event_id: i64,
    status: String,
    event_ends_at: Option<DateTime<Utc>>,
}

/// Reads registrations from the platform-owned `event_registrations` table.
#[derive(Clone)]
pub struct RegistrationRepository {
    pool: PgPool,
}

impl RegistrationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find(&self, registration_id: i64) -> Result<Option<RegistrationRow>, StoreError> {
        let timer = QueryTimer::new("find_registration");
        let result = sqlx::query_as::<_, RegistrationRow>(
            "SELECT event_id, status, event_ends_at FROM event_registrations WHERE id = $1",
        )
        .bind(registration_id)
        .fetch_optional(&self.pool)
        .await;
        timer.record();
        result.map_err(map_db_error)
    }
}

#[async_trait]
impl RegistrationDirectory for RegistrationRepository {
    async fn is_approved(&self, registration_id: i64) -> Result<Option<bool>, StoreError> {
        Ok(self
            .find(registration_id)
            .await?
            .map(|row| row.status.eq_ignore_ascii_case(APPROVED_STATUS)))
    }

    async fn event_for(&self, registration_id: i64) -> Result<Option<EventBinding>, StoreError> {
        Ok(self.find(registration_id).await?.map(|row| EventBinding {
            event_id: row.event_id,
            ends_at: row.event_ends_at,
        }))
    }
}

/// Writes check-ins to the platform-owned `event_attendance` table.
#[derive(Clone)]
pub struct AttendanceRepository {
    pool: PgPool,
}

impl AttendanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttendanceRecorder for AttendanceRepository {
    async fn record_attendance(
        &self,
        registration_id: i64,
        attempt: &ScanAttempt,
    ) -> Result<(), StoreError> {
        let timer = QueryTimer::new("record_attendance");
        let result = sqlx::query(
            r#"
            INSERT INTO event_attendance (
                scan_attempt_id, registration_id, event_id, access_point, checked_in_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (scan_attempt_id) DO NOTHING
            "#,
        )
        .bind(attempt.id)
        .bind(registration_id)
        .bind(attempt.event_id)
        .bind(&attempt.access_point)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await;
        timer.record();
        result.map_err(map_db_error)?;
        Ok(())
    }

    async fn find_unrecorded(&self, limit: i64) -> Result<Vec<ScanAttempt>, StoreError> {
        let timer = QueryTimer::new("find_unrecorded_attendance");
        let sql = format!(
            "SELECT {} FROM scan_attempts s \
             WHERE s.outcome = 'granted' \
               AND NOT EXISTS (SELECT 1 FROM event_attendance a WHERE a.scan_attempt_id = s.id) \
             ORDER BY s.attempted_at ASC LIMIT $1",
            SCAN_ATTEMPT_COLUMNS
        );
        let result = sqlx::query_as::<_, ScanAttemptEntity>(&sql)
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
}
