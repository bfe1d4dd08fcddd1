//! Integrity anchoring types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integrity state of a code as seen by the scan path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorStatus {
    /// Anchor service could not be reached or timed out.
    Unknown,
    /// Not anchored yet.
    Pending,
    /// Anchored record matches the stored code.
    Confirmed,
    /// Stored code no longer matches its anchored fingerprint.
    Mismatched,
}

impl AnchorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorStatus::Unknown => "unknown",
            AnchorStatus::Pending => "pending",
            AnchorStatus::Confirmed => "confirmed",
            AnchorStatus::Mismatched => "mismatched",
        }
    }

    /// Anything short of a confirmation flags the scan for manual review.
    pub fn needs_review(&self) -> bool {
        !matches!(self, AnchorStatus::Confirmed)
    }
}

impl std::fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Receipt returned by the anchor service after submission.
///
/// `receipt_id` is the service's own reference (a ledger transaction id, for
/// example). It is kept for dispute resolution and never compared against
/// the code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReceipt {
    pub receipt_id: String,
    pub anchored_at: DateTime<Utc>,
}

/// Answer from the anchor service about a previously submitted hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorVerification {
    pub anchored: bool,
    #[serde(default)]
    pub anchored_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tamper_evidence: bool,
}

/// Integrity report for one code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub code_id: Uuid,
    pub status: AnchorStatus,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchored_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_confirmed_skips_review() {
        assert!(!AnchorStatus::Confirmed.needs_review());
        assert!(AnchorStatus::Unknown.needs_review());
        assert!(AnchorStatus::Pending.needs_review());
        assert!(AnchorStatus::Mismatched.needs_review());
    }

    #[test]
    fn test_verification_defaults() {
        let verification: AnchorVerification =
            serde_json::from_str(r#"{"anchored": true}"#).unwrap();
        assert!(verification.anchored);
        assert!(!verification.tamper_evidence);
        assert!(verification.anchored_at.is_none());
    }
}
