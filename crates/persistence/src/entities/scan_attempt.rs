//! Scan attempt entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use domain::models::{ScanAttempt, ScanOutcome};

/// Columns selected for every scan attempt query.
pub const SCAN_ATTEMPT_COLUMNS: &str = "id, attempted_at, presented_token_hash, code_id, \
    registration_id, event_id, access_point, device_info, location, outcome, reason";

/// Database row mapping for the scan_attempts table.
#[derive(Debug, Clone, FromRow)]
pub struct ScanAttemptEntity {
    pub id: Uuid,
    pub attempted_at: DateTime<Utc>,
    pub presented_token_hash: String,
    pub code_id: Option<Uuid>,
    pub registration_id: Option<i64>,
    pub event_id: i64,
    pub access_point: String,
    pub device_info: Option<String>,
    pub location: Option<String>,
    pub outcome: String,
    pub reason: Option<String>,
}

impl ScanAttemptEntity {
    /// Convert to domain model.
    pub fn into_domain(self) -> Result<ScanAttempt, String> {
        let outcome = ScanOutcome::from_parts(&self.outcome, self.reason.as_deref())?;
        Ok(ScanAttempt {
            id: self.id,
            attempted_at: self.attempted_at,
            presented_token_hash: self.presented_token_hash.trim_end().to_string(),
            code_id: self.code_id,
            registration_id: self.registration_id,
            event_id: self.event_id,
            access_point: self.access_point,
            device_info: self.device_info,
            location: self.location,
            outcome,
        })
    }
}

impl TryFrom<ScanAttemptEntity> for ScanAttempt {
    type Error = String;

    fn try_from(entity: ScanAttemptEntity) -> Result<Self, Self::Error> {
        entity.into_domain()
    }
}
