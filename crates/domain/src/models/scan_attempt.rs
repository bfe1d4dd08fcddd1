//! Scan attempt domain model.
//!
//! Every validation that gets past token format checking leaves exactly one
//! append-only attempt record, granted or denied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use validator::Validate;

use shared::validation::validate_access_point;

// ============================================================================
// Reason Codes
// ============================================================================

/// Stable machine-readable denial reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    QrNotFound,
    QrExpired,
    QrAlreadyUsed,
    QrInvalidated,
    EventMismatch,
    RateLimited,
    InvalidHashFormat,
    InternalError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::QrNotFound => "QR_NOT_FOUND",
            ReasonCode::QrExpired => "QR_EXPIRED",
            ReasonCode::QrAlreadyUsed => "QR_ALREADY_USED",
            ReasonCode::QrInvalidated => "QR_INVALIDATED",
            ReasonCode::EventMismatch => "EVENT_MISMATCH",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::InvalidHashFormat => "INVALID_HASH_FORMAT",
            ReasonCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Human-readable message shown at the gate.
    pub fn message(&self) -> &'static str {
        match self {
            ReasonCode::QrNotFound => "QR code not recognized",
            ReasonCode::QrExpired => "QR code has expired",
            ReasonCode::QrAlreadyUsed => "QR code has already been used",
            ReasonCode::QrInvalidated => "QR code has been invalidated",
            ReasonCode::EventMismatch => "QR code is not valid for this event",
            ReasonCode::RateLimited => "Too many scans from this access point",
            ReasonCode::InvalidHashFormat => "QR code format is invalid",
            ReasonCode::InternalError => "Validation temporarily unavailable, please retry",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QR_NOT_FOUND" => Ok(ReasonCode::QrNotFound),
            "QR_EXPIRED" => Ok(ReasonCode::QrExpired),
            "QR_ALREADY_USED" => Ok(ReasonCode::QrAlreadyUsed),
            "QR_INVALIDATED" => Ok(ReasonCode::QrInvalidated),
            "EVENT_MISMATCH" => Ok(ReasonCode::EventMismatch),
            "RATE_LIMITED" => Ok(ReasonCode::RateLimited),
            "INVALID_HASH_FORMAT" => Ok(ReasonCode::InvalidHashFormat),
            "INTERNAL_ERROR" => Ok(ReasonCode::InternalError),
            _ => Err(format!("Invalid reason code: {}", s)),
        }
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Decision for a single scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Granted,
    Denied(ReasonCode),
}

impl ScanOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ScanOutcome::Granted)
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            ScanOutcome::Granted => None,
            ScanOutcome::Denied(reason) => Some(*reason),
        }
    }

    /// Outcome as stored: `granted` or `denied`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanOutcome::Granted => "granted",
            ScanOutcome::Denied(_) => "denied",
        }
    }

    /// Rebuild from the stored outcome column and optional reason column.
    pub fn from_parts(outcome: &str, reason: Option<&str>) -> Result<Self, String> {
        match (outcome, reason) {
            ("granted", None) => Ok(ScanOutcome::Granted),
            ("denied", Some(reason)) => Ok(ScanOutcome::Denied(reason.parse()?)),
            _ => Err(format!(
                "Inconsistent scan outcome: {} / {:?}",
                outcome, reason
            )),
        }
    }
}

// ============================================================================
// Core Model
// ============================================================================

/// Where and how a scan happened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanContext {
    pub access_point: String,
    pub device_info: Option<String>,
    pub location: Option<String>,
}

impl ScanContext {
    pub fn new(access_point: impl Into<String>) -> Self {
        Self {
            access_point: access_point.into(),
            ..Default::default()
        }
    }
}

/// Append-only audit record of one validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanAttempt {
    pub id: Uuid,
    pub attempted_at: DateTime<Utc>,
    /// Hash of the normalized presented token. The raw token is never logged.
    pub presented_token_hash: String,
    pub code_id: Option<Uuid>,
    pub registration_id: Option<i64>,
    pub event_id: i64,
    pub access_point: String,
    pub device_info: Option<String>,
    pub location: Option<String>,
    pub outcome: ScanOutcome,
}

// ============================================================================
// Request DTOs
// ============================================================================

/// Request payload for validating a scanned code.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ValidateScanRequest {
    /// Presented token; format is checked by the validator, not here.
    pub token: String,

    #[validate(range(min = 1, message = "eventId must be positive"))]
    pub event_id: i64,

    #[validate(custom(function = "validate_access_point"))]
    pub access_point: String,

    #[serde(default)]
    #[validate(length(max = 255, message = "deviceInfo cannot exceed 255 characters"))]
    pub device_info: Option<String>,

    #[serde(default)]
    #[validate(length(max = 255, message = "location cannot exceed 255 characters"))]
    pub location: Option<String>,

    #[serde(default)]
    pub verify_integrity: bool,
}

impl ValidateScanRequest {
    pub fn context(&self) -> ScanContext {
        ScanContext {
            access_point: self.access_point.clone(),
            device_info: self.device_info.clone(),
            location: self.location.clone(),
        }
    }
}

/// Query parameters for the dry-run switch on validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateScanQuery {
    #[serde(default)]
    pub dry_run: bool,
}

/// Query parameters for listing a code's scan attempts.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ListScanAttemptsQuery {
    pub cursor: Option<String>,

    #[validate(range(min = 1, max = 200, message = "limit must be between 1 and 200"))]
    pub limit: Option<i64>,
}

// ============================================================================
// Response DTOs
// ============================================================================

/// Scan decision returned to the scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<super::integrity::AnchorStatus>,
    /// Set when a grant was issued while integrity could not be confirmed.
    pub review_required: bool,
    pub dry_run: bool,
}

impl ValidationResponse {
    /// Denial without any code context.
    pub fn denied(reason: ReasonCode) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason),
            message: reason.message().to_string(),
            registration_id: None,
            code_id: None,
            usage_count: None,
            metadata: None,
            integrity: None,
            review_required: false,
            dry_run: false,
        }
    }
}

/// One scan attempt as exposed by the audit listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanAttemptResponse {
    pub id: Uuid,
    pub attempted_at: DateTime<Utc>,
    pub event_id: i64,
    pub access_point: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
}

impl From<ScanAttempt> for ScanAttemptResponse {
    fn from(attempt: ScanAttempt) -> Self {
        Self {
            id: attempt.id,
            attempted_at: attempt.attempted_at,
            event_id: attempt.event_id,
            access_point: attempt.access_point,
            device_info: attempt.device_info,
            location: attempt.location,
            outcome: attempt.outcome.as_str().to_string(),
            reason: attempt.outcome.reason(),
        }
    }
}

/// Pagination info for cursor listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPagination {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Scan attempt listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListScanAttemptsResponse {
    pub data: Vec<ScanAttemptResponse>,
    pub pagination: CursorPagination,
}
