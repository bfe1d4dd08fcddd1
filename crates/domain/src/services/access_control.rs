//! Entry point wiring the access-code services together.
//!
//! Callers (HTTP handlers, background jobs) go through [`AccessControl`]
//! instead of assembling the individual services.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{CodeError, ScanError, StoreError};
use crate::models::{AccessCode, AnchorStatus, CodeStats, IntegrityReport, ScanAttempt, ScanContext};

use super::clock::Clock;
use super::integrity::{IntegrityCoordinator, IntegrityPolicy};
use super::issuer::{CodeIssuer, IssueOptions, IssuedCode, IssuerPolicy};
use super::ports::{
    AccessCodeStore, AttendanceRecorder, IntegrityAnchor, RegistrationDirectory, ScanAttemptLog,
};
use super::regeneration::{Regenerated, RegenerationCoordinator};
use super::scan_validator::{ScanValidator, ValidationResult};

/// Adapters the services run against.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn AccessCodeStore>,
    pub attempts: Arc<dyn ScanAttemptLog>,
    pub registrations: Arc<dyn RegistrationDirectory>,
    pub attendance: Arc<dyn AttendanceRecorder>,
    /// `None` disables anchoring and integrity checks.
    pub anchor: Option<Arc<dyn IntegrityAnchor>>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessControlSettings {
    pub issuer: IssuerPolicy,
    pub integrity: IntegrityPolicy,
}

/// One page of scan attempts.
#[derive(Debug, Clone)]
pub struct ScanAttemptPage {
    pub attempts: Vec<ScanAttempt>,
    pub has_more: bool,
}

/// Counters from one background sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub processed: usize,
    pub failed: usize,
}

pub struct AccessControl {
    issuer: Arc<CodeIssuer>,
    validator: ScanValidator,
    regeneration: RegenerationCoordinator,
    integrity: Option<Arc<IntegrityCoordinator>>,
    store: Arc<dyn AccessCodeStore>,
    attempts: Arc<dyn ScanAttemptLog>,
    attendance: Arc<dyn AttendanceRecorder>,
    clock: Arc<dyn Clock>,
}

impl AccessControl {
    pub fn new(collaborators: Collaborators, settings: AccessControlSettings) -> Self {
        let Collaborators {
            store,
            attempts,
            registrations,
            attendance,
            anchor,
            clock,
        } = collaborators;

        let integrity = anchor.map(|anchor| {
            Arc::new(IntegrityCoordinator::new(
                anchor,
                store.clone(),
                settings.integrity,
            ))
        });
        let issuer = Arc::new(CodeIssuer::new(
            store.clone(),
            registrations,
            clock.clone(),
            settings.issuer,
        ));
        let validator = ScanValidator::new(
            store.clone(),
            attempts.clone(),
            attendance.clone(),
            integrity.clone(),
            clock.clone(),
        );
        let regeneration = RegenerationCoordinator::new(store.clone(), issuer.clone(), clock.clone());

        Self {
            issuer,
            validator,
            regeneration,
            integrity,
            store,
            attempts,
            attendance,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn anchoring_enabled(&self) -> bool {
        self.integrity.is_some()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub async fn issue(
        &self,
        registration_id: i64,
        options: IssueOptions,
    ) -> Result<IssuedCode, CodeError> {
        let issued = self.issuer.issue(registration_id, options).await?;
        self.anchor_in_background(&issued.code);
        Ok(issued)
    }

    pub async fn regenerate(
        &self,
        registration_id: i64,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
        actor: &str,
    ) -> Result<Regenerated, CodeError> {
        let regenerated = self
            .regeneration
            .regenerate(registration_id, reason, expires_at, actor)
            .await?;
        self.anchor_in_background(&regenerated.new_code.code);
        Ok(regenerated)
    }

    pub async fn invalidate(
        &self,
        code_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<AccessCode, CodeError> {
        self.regeneration.invalidate(code_id, reason, actor).await
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    pub async fn validate(
        &self,
        presented_token: &str,
        event_id: i64,
        context: ScanContext,
        verify_integrity: bool,
    ) -> Result<ValidationResult, ScanError> {
        self.validator
            .validate(presented_token, event_id, context, verify_integrity)
            .await
    }

    pub async fn check(
        &self,
        presented_token: &str,
        event_id: i64,
        verify_integrity: bool,
    ) -> Result<ValidationResult, ScanError> {
        self.validator
            .check(presented_token, event_id, verify_integrity)
            .await
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn get_code(&self, code_id: Uuid) -> Result<AccessCode, CodeError> {
        self.store
            .find_by_id(code_id)
            .await?
            .ok_or(CodeError::CodeNotFound(code_id))
    }

    pub async fn codes_for_registration(
        &self,
        registration_id: i64,
    ) -> Result<Vec<AccessCode>, CodeError> {
        Ok(self.store.list_for_registration(registration_id).await?)
    }

    pub async fn scan_attempts(
        &self,
        code_id: Uuid,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<ScanAttemptPage, CodeError> {
        self.get_code(code_id).await?;

        let mut attempts = self.attempts.list_for_code(code_id, before, limit + 1).await?;
        let has_more = attempts.len() as i64 > limit;
        if has_more {
            attempts.truncate(limit as usize);
        }
        Ok(ScanAttemptPage { attempts, has_more })
    }

    pub async fn stats(&self, event_id: i64) -> Result<CodeStats, CodeError> {
        Ok(self.store.stats_for_event(event_id, self.clock.now()).await?)
    }

    pub async fn integrity_report(&self, code_id: Uuid) -> Result<IntegrityReport, CodeError> {
        let code = self.get_code(code_id).await?;
        match &self.integrity {
            Some(coordinator) => Ok(coordinator.report(&code).await),
            None => Ok(IntegrityReport {
                code_id: code.id,
                status: AnchorStatus::Unknown,
                fingerprint: code.integrity_fingerprint(),
                anchor_hash: code.anchor_hash,
                anchor_receipt: code.anchor_receipt,
                anchored_at: code.anchored_at,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Anchor active codes that have no anchor yet.
    pub async fn anchor_pending(&self, limit: i64) -> Result<SweepSummary, StoreError> {
        let Some(coordinator) = &self.integrity else {
            return Ok(SweepSummary::default());
        };

        let mut summary = SweepSummary::default();
        for code in self.store.list_unanchored(limit).await? {
            summary.processed += 1;
            if coordinator.anchor_code(&code).await.is_err() {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    /// Record attendance for granted scans that missed it.
    pub async fn backfill_attendance(&self, limit: i64) -> Result<SweepSummary, StoreError> {
        let mut summary = SweepSummary::default();
        for attempt in self.attendance.find_unrecorded(limit).await? {
            summary.processed += 1;
            let Some(registration_id) = attempt.registration_id else {
                continue;
            };
            if let Err(e) = self
                .attendance
                .record_attendance(registration_id, &attempt)
                .await
            {
                summary.failed += 1;
                warn!(attempt_id = %attempt.id, error = %e, "Attendance backfill failed");
            }
        }
        Ok(summary)
    }

    /// Delete scan attempts older than `cutoff`.
    pub async fn purge_scan_attempts(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.attempts.purge_older_than(cutoff).await
    }

    fn anchor_in_background(&self, code: &AccessCode) {
        if let Some(coordinator) = &self.integrity {
            debug!(code_id = %code.id, "Scheduling anchor");
            coordinator.spawn_anchor(code.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScanOutcome, ScanPolicy};
    use crate::services::clock::ManualClock;
    use crate::services::integrity::MockIntegrityAnchor;
    use crate::services::memory::{
        InMemoryAccessCodeStore, InMemoryAttendanceRecorder, InMemoryScanAttemptLog,
        StaticRegistrationDirectory,
    };
    use chrono::{Duration, TimeZone};

    struct Harness {
        access: AccessControl,
        attempts: Arc<InMemoryScanAttemptLog>,
        attendance: Arc<InMemoryAttendanceRecorder>,
        anchor: Arc<MockIntegrityAnchor>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryAccessCodeStore::new());
        let attempts = Arc::new(InMemoryScanAttemptLog::new());
        let attendance = Arc::new(InMemoryAttendanceRecorder::with_log(attempts.clone()));
        let registrations = Arc::new(StaticRegistrationDirectory::new());
        registrations.approve(123, 7, None);
        let anchor = Arc::new(MockIntegrityAnchor::failing());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let access = AccessControl::new(
            Collaborators {
                store,
                attempts: attempts.clone(),
                registrations,
                attendance: attendance.clone(),
                anchor: Some(anchor.clone()),
                clock: clock.clone(),
            },
            AccessControlSettings {
                issuer: IssuerPolicy::default(),
                integrity: IntegrityPolicy {
                    timeout: std::time::Duration::from_millis(50),
                    scan_budget: std::time::Duration::from_millis(50),
                    max_attempts: 1,
                    initial_backoff: std::time::Duration::from_millis(1),
                },
            },
        );
        Harness {
            access,
            attempts,
            attendance,
            anchor,
            clock,
        }
    }

    #[tokio::test]
    async fn test_anchor_outage_does_not_block_issuance() {
        let h = harness();
        let issued = h.access.issue(123, IssueOptions::default()).await.unwrap();
        assert_eq!(issued.code.anchor_hash, None);

        let result = h
            .access
            .validate(&issued.token, 7, ScanContext::new("gate"), false)
            .await
            .unwrap();
        assert!(result.is_granted());
    }

    #[tokio::test]
    async fn test_anchor_sweep_after_recovery() {
        let h = harness();
        let issued = h.access.issue(123, IssueOptions::default()).await.unwrap();
        // Let the background attempt run (and fail) first
        tokio::task::yield_now().await;

        let summary = h.access.anchor_pending(10).await.unwrap();
        assert_eq!(summary, SweepSummary { processed: 1, failed: 1 });

        h.anchor.set_failing(false);
        let summary = h.access.anchor_pending(10).await.unwrap();
        assert_eq!(summary, SweepSummary { processed: 1, failed: 0 });

        let report = h.access.integrity_report(issued.code.id).await.unwrap();
        assert_eq!(report.status, AnchorStatus::Confirmed);
        assert_eq!(h.access.anchor_pending(10).await.unwrap().processed, 0);
    }

    #[tokio::test]
    async fn test_scan_attempt_paging() {
        let h = harness();
        let issued = h
            .access
            .issue(
                123,
                IssueOptions {
                    scan_policy: Some(ScanPolicy::MultiUse),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for _ in 0..5 {
            h.clock.advance(Duration::seconds(1));
            h.access
                .validate(&issued.token, 7, ScanContext::new("gate"), false)
                .await
                .unwrap();
        }

        let page = h.access.scan_attempts(issued.code.id, None, 3).await.unwrap();
        assert_eq!(page.attempts.len(), 3);
        assert!(page.has_more);

        let last = page.attempts.last().unwrap();
        let next = h
            .access
            .scan_attempts(issued.code.id, Some((last.attempted_at, last.id)), 3)
            .await
            .unwrap();
        assert_eq!(next.attempts.len(), 2);
        assert!(!next.has_more);

        let err = h
            .access
            .scan_attempts(Uuid::new_v4(), None, 3)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CODE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_stats_counts_lazy_expiry() {
        let h = harness();
        h.access
            .issue(
                123,
                IssueOptions {
                    expires_at: Some(h.clock.now() + Duration::minutes(5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stats = h.access.stats(7).await.unwrap();
        assert_eq!(stats.active, 1);

        h.clock.advance(Duration::minutes(10));
        let stats = h.access.stats(7).await.unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test]
    async fn test_backfill_and_purge() {
        let h = harness();
        let issued = h.access.issue(123, IssueOptions::default()).await.unwrap();
        h.attendance.set_unavailable(true);
        let result = h
            .access
            .validate(&issued.token, 7, ScanContext::new("gate"), false)
            .await
            .unwrap();
        assert_eq!(result.outcome, ScanOutcome::Granted);

        h.attendance.set_unavailable(false);
        let summary = h.access.backfill_attendance(10).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert!(h.attendance.is_recorded(result.attempt_id.unwrap()));

        h.clock.advance(Duration::days(100));
        let removed = h
            .access
            .purge_scan_attempts(h.clock.now() - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(h.attempts.all().is_empty());
    }
}
