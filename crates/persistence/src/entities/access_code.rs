//! Access code entity (database row mapping).

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use domain::models::{AccessCode, CodeStatus, ScanPolicy};

/// Columns selected for every access code query.
pub const ACCESS_CODE_COLUMNS: &str = "id, registration_id, event_id, token_hash, status, \
    scan_policy, issued_at, expires_at, usage_count, last_used_at, invalidation_reason, \
    invalidated_at, invalidated_by, replaces_code_id, metadata, anchor_hash, anchor_receipt, anchored_at";

/// Database row mapping for the access_codes table.
#[derive(Debug, Clone, FromRow)]
pub struct AccessCodeEntity {
    pub id: Uuid,
    pub registration_id: i64,
    pub event_id: i64,
    pub token_hash: String,
    pub status: String,
    pub scan_policy: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub usage_count: i32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub invalidation_reason: Option<String>,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub invalidated_by: Option<String>,
    pub replaces_code_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub anchor_hash: Option<String>,
    pub anchor_receipt: Option<String>,
    pub anchored_at: Option<DateTime<Utc>>,
}

impl AccessCodeEntity {
    /// Convert to domain model.
    ///
    /// Unknown status or policy values are rejected rather than defaulted,
    /// since a wrong default could admit a revoked code.
    pub fn into_domain(self) -> Result<AccessCode, String> {
        let status = self.status.parse::<CodeStatus>()?;
        let scan_policy = self.scan_policy.parse::<ScanPolicy>()?;

        Ok(AccessCode {
            id: self.id,
            registration_id: self.registration_id,
            event_id: self.event_id,
            // CHAR(64) pads; hashes are always full length but trim anyway
            token_hash: self.token_hash.trim_end().to_string(),
            status,
            scan_policy,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            usage_count: self.usage_count,
            last_used_at: self.last_used_at,
            invalidation_reason: self.invalidation_reason,
            invalidated_at: self.invalidated_at,
            invalidated_by: self.invalidated_by,
            replaces_code_id: self.replaces_code_id,
            metadata: self.metadata,
            anchor_hash: self.anchor_hash,
            anchor_receipt: self.anchor_receipt,
            anchored_at: self.anchored_at,
        })
    }
}

impl TryFrom<AccessCodeEntity> for AccessCode {
    type Error = String;

    fn try_from(entity: AccessCodeEntity) -> Result<Self, Self::Error> {
        entity.into_domain()
    }
}
