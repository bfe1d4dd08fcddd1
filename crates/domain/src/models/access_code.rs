//! Access code domain model.
//!
//! An access code grants one approved registration entry to its event. The
//! presented token (the QR payload) is never stored; only its SHA-256 hash is.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use validator::Validate;

use shared::crypto::{
    is_hex_digest, normalize_hex_token, secure_random_bytes, sha256_hex, sha256_hex_bytes,
};
use shared::validation::{validate_metadata, validate_reason};

use super::scan_attempt::ReasonCode;

/// Number of random bytes mixed into each token.
const TOKEN_RANDOM_BYTES: usize = 32;

// ============================================================================
// Code Status Enum
// ============================================================================

/// Lifecycle state of an access code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeStatus {
    Active,
    Used,
    Expired,
    Invalidated,
}

impl CodeStatus {
    /// Returns the string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStatus::Active => "active",
            CodeStatus::Used => "used",
            CodeStatus::Expired => "expired",
            CodeStatus::Invalidated => "invalidated",
        }
    }

    /// Terminal states never return to `active`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CodeStatus::Active)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: CodeStatus) -> bool {
        match (self, target) {
            // Multi-use scan keeps the code active
            (CodeStatus::Active, CodeStatus::Active) => true,
            (CodeStatus::Active, CodeStatus::Used) => true,
            (CodeStatus::Active, CodeStatus::Expired) => true,
            (CodeStatus::Active, CodeStatus::Invalidated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CodeStatus::Active),
            "used" => Ok(CodeStatus::Used),
            "expired" => Ok(CodeStatus::Expired),
            "invalidated" => Ok(CodeStatus::Invalidated),
            _ => Err(format!(
                "Invalid code status: {}. Must be one of: active, used, expired, invalidated",
                s
            )),
        }
    }
}

// ============================================================================
// Scan Policy Enum
// ============================================================================

/// Whether a code admits one scan or repeated scans until expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPolicy {
    #[default]
    SingleUse,
    MultiUse,
}

impl ScanPolicy {
    /// Returns the string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPolicy::SingleUse => "single_use",
            ScanPolicy::MultiUse => "multi_use",
        }
    }

    /// Status a code moves to after a successful scan under this policy.
    pub fn status_after_scan(&self) -> CodeStatus {
        match self {
            ScanPolicy::SingleUse => CodeStatus::Used,
            ScanPolicy::MultiUse => CodeStatus::Active,
        }
    }
}

impl fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ScanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single_use" => Ok(ScanPolicy::SingleUse),
            "multi_use" => Ok(ScanPolicy::MultiUse),
            _ => Err(format!(
                "Invalid scan policy: {}. Must be one of: single_use, multi_use",
                s
            )),
        }
    }
}

// ============================================================================
// Core Model
// ============================================================================

/// An issued access code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCode {
    pub id: Uuid,
    pub registration_id: i64,
    pub event_id: i64,
    pub token_hash: String,
    pub status: CodeStatus,
    pub scan_policy: ScanPolicy,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub usage_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidated_by: Option<String>,
    /// Code this one superseded through regeneration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaces_code_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    /// Fingerprint submitted to the anchor service, set once anchoring succeeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_hash: Option<String>,
    /// Anchor service's reference for the submission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchored_at: Option<DateTime<Utc>>,
}

impl AccessCode {
    /// Expiry is evaluated on read; the stored status may still say `active`.
    pub fn is_logically_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Status as observed at `now`, folding in lazy expiry.
    pub fn effective_status(&self, now: DateTime<Utc>) -> CodeStatus {
        match self.status {
            CodeStatus::Active if self.is_logically_expired(now) => CodeStatus::Expired,
            status => status,
        }
    }

    /// Pure scan predicate. Never mutates; safe for dry runs.
    pub fn is_valid_for_scan(&self, now: DateTime<Utc>) -> bool {
        self.status == CodeStatus::Active
            && now < self.expires_at
            && (self.scan_policy == ScanPolicy::MultiUse || self.usage_count == 0)
    }

    /// Classifies why a scan at `now` would be denied.
    ///
    /// Terminal states win over expiry so that a used code reports
    /// `QR_ALREADY_USED` even after its window closed.
    pub fn scan_eligibility(&self, now: DateTime<Utc>) -> Result<(), ReasonCode> {
        match self.status {
            CodeStatus::Invalidated => return Err(ReasonCode::QrInvalidated),
            CodeStatus::Used => return Err(ReasonCode::QrAlreadyUsed),
            CodeStatus::Expired => return Err(ReasonCode::QrExpired),
            CodeStatus::Active => {}
        }

        if self.is_logically_expired(now) {
            return Err(ReasonCode::QrExpired);
        }

        if self.scan_policy == ScanPolicy::SingleUse && self.usage_count > 0 {
            return Err(ReasonCode::QrAlreadyUsed);
        }

        debug_assert!(self.is_valid_for_scan(now));
        Ok(())
    }

    /// Deterministic digest of the immutable fields, submitted for anchoring.
    pub fn integrity_fingerprint(&self) -> String {
        let canonical = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.registration_id,
            self.event_id,
            self.token_hash,
            self.scan_policy.as_str(),
            self.issued_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.expires_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        sha256_hex(&canonical)
    }
}

/// Counts of codes by effective status for one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeStats {
    pub active: i64,
    pub used: i64,
    pub expired: i64,
    pub invalidated: i64,
}

impl CodeStats {
    /// Adds one code in the given status.
    pub fn count(&mut self, status: CodeStatus) {
        match status {
            CodeStatus::Active => self.active += 1,
            CodeStatus::Used => self.used += 1,
            CodeStatus::Expired => self.expired += 1,
            CodeStatus::Invalidated => self.invalidated += 1,
        }
    }

    pub fn total(&self) -> i64 {
        self.active + self.used + self.expired + self.invalidated
    }
}

// ============================================================================
// Token Derivation
// ============================================================================

/// Generate a new presented token for a registration.
///
/// 32 bytes from the OS CSPRNG are mixed with the registration id and a
/// nanosecond timestamp, then hashed into 64 lowercase hex characters.
pub fn generate_token(registration_id: i64, now: DateTime<Utc>) -> String {
    let random: [u8; TOKEN_RANDOM_BYTES] = secure_random_bytes();
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros());

    let mut material = Vec::with_capacity(TOKEN_RANDOM_BYTES + 16);
    material.extend_from_slice(&random);
    material.extend_from_slice(&registration_id.to_be_bytes());
    material.extend_from_slice(&nanos.to_be_bytes());

    sha256_hex_bytes(&material)
}

/// Hash a presented token into its stored form.
pub fn hash_token(token: &str) -> String {
    sha256_hex(token)
}

/// Normalize and format-check a presented token.
///
/// Returns `None` for anything that is not 64 hex characters, so malformed
/// input never reaches storage.
pub fn normalize_presented_token(raw: &str) -> Option<String> {
    let normalized = normalize_hex_token(raw);
    is_hex_digest(&normalized).then_some(normalized)
}

/// Default expiry: the later of the event end and `now + window`.
pub fn default_expiry(
    now: DateTime<Utc>,
    event_ends_at: Option<DateTime<Utc>>,
    window: Duration,
) -> DateTime<Utc> {
    let policy_expiry = now + window;
    match event_ends_at {
        Some(ends_at) if ends_at > policy_expiry => ends_at,
        _ => policy_expiry,
    }
}

// ============================================================================
// Request DTOs
// ============================================================================

/// Request payload for issuing a code.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IssueCodeRequest {
    #[validate(range(min = 1, message = "registrationId must be positive"))]
    pub registration_id: i64,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    #[validate(custom(function = "validate_metadata"))]
    pub metadata: Option<serde_json::Value>,

    #[serde(default)]
    pub scan_policy: Option<ScanPolicy>,
}

/// Request payload for regenerating a registration's code.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateCodeRequest {
    #[validate(custom(function = "validate_reason"))]
    pub reason: String,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Request payload for invalidating a code.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateCodeRequest {
    #[validate(custom(function = "validate_reason"))]
    pub reason: String,
}

// ============================================================================
// Response DTOs
// ============================================================================

/// Response returned once at issuance; the only time the token is exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCodeResponse {
    pub code_id: Uuid,
    pub token: String,
    pub registration_id: i64,
    pub event_id: i64,
    pub expires_at: DateTime<Utc>,
    pub status: CodeStatus,
    pub scan_policy: ScanPolicy,
}

/// Public view of a code (no token, no hash).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCodeResponse {
    pub code_id: Uuid,
    pub registration_id: i64,
    pub event_id: i64,
    pub status: CodeStatus,
    pub scan_policy: ScanPolicy,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub usage_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidated_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaces_code_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub anchored: bool,
}

impl AccessCodeResponse {
    /// Build the view with status evaluated at `now`.
    pub fn from_code(code: AccessCode, now: DateTime<Utc>) -> Self {
        let status = code.effective_status(now);
        Self {
            code_id: code.id,
            registration_id: code.registration_id,
            event_id: code.event_id,
            status,
            scan_policy: code.scan_policy,
            issued_at: code.issued_at,
            expires_at: code.expires_at,
            usage_count: code.usage_count,
            last_used_at: code.last_used_at,
            invalidation_reason: code.invalidation_reason,
            invalidated_at: code.invalidated_at,
            invalidated_by: code.invalidated_by,
            replaces_code_id: code.replaces_code_id,
            metadata: code.metadata,
            anchored: code.anchor_hash.is_some(),
        }
    }
}

/// Response for a regeneration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateCodeResponse {
    pub old_code: AccessCodeResponse,
    pub new_code: IssuedCodeResponse,
}

/// Response for an invalidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateCodeResponse {
    pub code_id: Uuid,
    pub status: CodeStatus,
    pub invalidated_at: Option<DateTime<Utc>>,
}

/// Code history for one registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationCodesResponse {
    pub registration_id: i64,
    pub data: Vec<AccessCodeResponse>,
}

/// Per-event counts by status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeStatsResponse {
    pub event_id: i64,
    pub active: i64,
    pub used: i64,
    pub expired: i64,
    pub invalidated: i64,
    pub total: i64,
}

impl CodeStatsResponse {
    pub fn new(event_id: i64, stats: CodeStats) -> Self {
        Self {
            event_id,
            active: stats.active,
            used: stats.used,
            expired: stats.expired,
            invalidated: stats.invalidated,
            total: stats.total(),
        }
    }
}
