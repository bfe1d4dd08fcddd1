//! Scan validation.
//!
//! The only mutation on the scan path is a single conditional update per
//! code. Denials are returned as outcomes; only infrastructure failures are
//! errors, so a caller can tell "definitely invalid" from "could not decide".

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ScanError;
use crate::models::access_code::{hash_token, normalize_presented_token};
use crate::models::{
    AccessCode, AnchorStatus, CodeStatus, ReasonCode, ScanAttempt, ScanContext, ScanOutcome,
};

use super::clock::Clock;
use super::integrity::IntegrityCoordinator;
use super::ports::{AccessCodeStore, AttendanceRecorder, ScanAttemptLog};

/// Result of validating one scan.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub outcome: ScanOutcome,
    /// Code state after the decision, when the token resolved to a code.
    pub code: Option<AccessCode>,
    /// Set when integrity verification was requested and possible.
    pub integrity: Option<AnchorStatus>,
    /// Id of the logged attempt; `None` for dry runs or a failed log write.
    pub attempt_id: Option<Uuid>,
    pub dry_run: bool,
}

impl ValidationResult {
    pub fn is_granted(&self) -> bool {
        self.outcome.is_granted()
    }

    /// A grant whose integrity could not be confirmed.
    pub fn review_required(&self) -> bool {
        self.is_granted() && self.integrity.is_some_and(|s| s.needs_review())
    }
}

/// Validates scanned tokens at access points.
pub struct ScanValidator {
    store: Arc<dyn AccessCodeStore>,
    attempts: Arc<dyn ScanAttemptLog>,
    attendance: Arc<dyn AttendanceRecorder>,
    integrity: Option<Arc<IntegrityCoordinator>>,
    clock: Arc<dyn Clock>,
}

impl ScanValidator {
    pub fn new(
        store: Arc<dyn AccessCodeStore>,
        attempts: Arc<dyn ScanAttemptLog>,
        attendance: Arc<dyn AttendanceRecorder>,
        integrity: Option<Arc<IntegrityCoordinator>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            attempts,
            attendance,
            integrity,
            clock,
        }
    }

    /// Validate a presented token and commit the scan when eligible.
    ///
    /// Malformed tokens fail with [`ScanError::InvalidHashFormat`] before any
    /// storage access and leave no attempt record.
    pub async fn validate(
        &self,
        presented_token: &str,
        event_id: i64,
        context: ScanContext,
        verify_integrity: bool,
    ) -> Result<ValidationResult, ScanError> {
        let token = normalize_presented_token(presented_token).ok_or(ScanError::InvalidHashFormat)?;
        let token_hash = hash_token(&token);
        let now = self.clock.now();

        let found = self.store.find_by_token_hash(&token_hash).await?;
        let (outcome, code, integrity) = match found {
            None => (ScanOutcome::Denied(ReasonCode::QrNotFound), None, None),
            Some(code) => self.decide(code, event_id, now, verify_integrity).await?,
        };

        let attempt = ScanAttempt {
            id: Uuid::new_v4(),
            attempted_at: now,
            presented_token_hash: token_hash,
            code_id: code.as_ref().map(|c| c.id),
            registration_id: code.as_ref().map(|c| c.registration_id),
            event_id,
            access_point: context.access_point,
            device_info: context.device_info,
            location: context.location,
            outcome,
        };

        let attempt_id = match self.attempts.append(&attempt).await {
            Ok(()) => Some(attempt.id),
            Err(e) => {
                warn!(
                    code_id = ?attempt.code_id,
                    outcome = attempt.outcome.as_str(),
                    error = %e,
                    "Failed to append scan attempt"
                );
                None
            }
        };

        match outcome {
            ScanOutcome::Granted => {
                if let Some(code) = &code {
                    info!(
                        code_id = %code.id,
                        registration_id = code.registration_id,
                        event_id,
                        access_point = %attempt.access_point,
                        usage_count = code.usage_count,
                        "Access granted"
                    );
                    self.record_attendance(code.registration_id, &attempt).await;
                }
            }
            ScanOutcome::Denied(reason) => {
                info!(
                    code_id = ?attempt.code_id,
                    event_id,
                    access_point = %attempt.access_point,
                    reason = %reason,
                    "Access denied"
                );
            }
        }

        Ok(ValidationResult {
            outcome,
            code,
            integrity,
            attempt_id,
            dry_run: false,
        })
    }

    /// Dry run: format check, lookup, event check and the pure predicate.
    ///
    /// Writes nothing.
    pub async fn check(
        &self,
        presented_token: &str,
        event_id: i64,
        verify_integrity: bool,
    ) -> Result<ValidationResult, ScanError> {
        let token = normalize_presented_token(presented_token).ok_or(ScanError::InvalidHashFormat)?;
        let now = self.clock.now();

        let Some(code) = self.store.find_by_token_hash(&hash_token(&token)).await? else {
            return Ok(ValidationResult {
                outcome: ScanOutcome::Denied(ReasonCode::QrNotFound),
                code: None,
                integrity: None,
                attempt_id: None,
                dry_run: true,
            });
        };

        let outcome = if code.event_id != event_id {
            ScanOutcome::Denied(ReasonCode::EventMismatch)
        } else {
            match code.scan_eligibility(now) {
                Ok(()) => ScanOutcome::Granted,
                Err(reason) => ScanOutcome::Denied(reason),
            }
        };

        let integrity = match (&self.integrity, verify_integrity, outcome) {
            (Some(coordinator), true, ScanOutcome::Granted) => {
                Some(coordinator.verify_for_scan(&code).await)
            }
            _ => None,
        };

        Ok(ValidationResult {
            outcome,
            code: Some(code),
            integrity,
            attempt_id: None,
            dry_run: true,
        })
    }

    async fn decide(
        &self,
        code: AccessCode,
        event_id: i64,
        now: DateTime<Utc>,
        verify_integrity: bool,
    ) -> Result<(ScanOutcome, Option<AccessCode>, Option<AnchorStatus>), ScanError> {
        if code.event_id != event_id {
            return Ok((ScanOutcome::Denied(ReasonCode::EventMismatch), Some(code), None));
        }

        if let Err(reason) = code.scan_eligibility(now) {
            if reason == ReasonCode::QrExpired && code.status == CodeStatus::Active {
                self.persist_expiry(&code, now).await;
            }
            return Ok((ScanOutcome::Denied(reason), Some(code), None));
        }

        // Integrity check runs beside the commit under the scan budget; it
        // never gates the decision
        let verification = async {
            match (&self.integrity, verify_integrity) {
                (Some(coordinator), true) => Some(coordinator.verify_for_scan(&code).await),
                _ => None,
            }
        };
        let commit = self.store.commit_scan(code.id, code.scan_policy, now);
        let (integrity, committed) = tokio::join!(verification, commit);

        match committed? {
            Some(updated) => Ok((ScanOutcome::Granted, Some(updated), integrity)),
            None => {
                // Lost the race; classify against the current row
                let current = self.store.find_by_id(code.id).await?.unwrap_or(code);
                let reason = current
                    .scan_eligibility(now)
                    .err()
                    .unwrap_or(ReasonCode::QrAlreadyUsed);
                debug!(code_id = %current.id, reason = %reason, "Scan commit lost race");
                Ok((ScanOutcome::Denied(reason), Some(current), None))
            }
        }
    }

    async fn persist_expiry(&self, code: &AccessCode, now: DateTime<Utc>) {
        if let Err(e) = self.store.mark_expired(code.id, now).await {
            debug!(code_id = %code.id, error = %e, "Lazy expiry not persisted");
        }
    }

    async fn record_attendance(&self, registration_id: i64, attempt: &ScanAttempt) {
        // The grant is final; a failure here is retried by the backfill job
        if let Err(e) = self
            .attendance
            .record_attendance(registration_id, attempt)
            .await
        {
            metrics::counter!("attendance_record_failures_total").increment(1);
            warn!(
                registration_id,
                attempt_id = %attempt.id,
                error = %e,
                "Failed to record attendance"
            );
        }
    }
}
