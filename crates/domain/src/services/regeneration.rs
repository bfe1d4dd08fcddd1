//! Regeneration and invalidation of access codes.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::errors::{CodeError, StoreError};
use crate::models::AccessCode;

use super::clock::Clock;
use super::issuer::{CodeIssuer, IssuedCode};
use super::ports::{AccessCodeStore, Invalidation};

/// Outcome of a regeneration.
#[derive(Debug, Clone)]
pub struct Regenerated {
    pub old_code: AccessCode,
    pub new_code: IssuedCode,
}

/// Supersedes and revokes codes.
pub struct RegenerationCoordinator {
    store: Arc<dyn AccessCodeStore>,
    issuer: Arc<CodeIssuer>,
    clock: Arc<dyn Clock>,
}

impl RegenerationCoordinator {
    pub fn new(
        store: Arc<dyn AccessCodeStore>,
        issuer: Arc<CodeIssuer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            issuer,
            clock,
        }
    }

    /// Invalidate the registration's active code and issue its replacement.
    ///
    /// Both writes commit together, so a registration never has two active
    /// codes and never loses its active code to a half-finished regeneration.
    pub async fn regenerate(
        &self,
        registration_id: i64,
        reason: &str,
        expires_at: Option<DateTime<Utc>>,
        actor: &str,
    ) -> Result<Regenerated, CodeError> {
        let current = self
            .store
            .find_active_for_registration(registration_id)
            .await?
            .ok_or(CodeError::ActiveCodeNotFound(registration_id))?;

        let replacement = self.issuer.prepare_replacement(&current, expires_at).await?;
        let invalidation = Invalidation {
            reason: reason.to_string(),
            invalidated_by: actor.to_string(),
            at: self.clock.now(),
        };

        let old_code = self
            .store
            .replace_active(current.id, &invalidation, &replacement.code)
            .await
            .map_err(|e| match e {
                StoreError::DuplicateToken => CodeError::TokenCollision,
                StoreError::ActiveCodeExists => CodeError::CodeAlreadyExists(registration_id),
                other => CodeError::Store(other),
            })?
            // Someone else consumed or revoked it first
            .ok_or(CodeError::ActiveCodeNotFound(registration_id))?;

        info!(
            registration_id,
            old_code_id = %old_code.id,
            new_code_id = %replacement.code.id,
            reason = %reason,
            actor = %actor,
            "Access code regenerated"
        );

        Ok(Regenerated {
            old_code,
            new_code: replacement,
        })
    }

    /// Revoke a single code.
    pub async fn invalidate(
        &self,
        code_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<AccessCode, CodeError> {
        let code = self
            .store
            .find_by_id(code_id)
            .await?
            .ok_or(CodeError::CodeNotFound(code_id))?;

        if !code.status.can_transition_to(crate::models::CodeStatus::Invalidated) {
            return Err(CodeError::CodeNotActive {
                code_id,
                status: code.status,
            });
        }

        let invalidation = Invalidation {
            reason: reason.to_string(),
            invalidated_by: actor.to_string(),
            at: self.clock.now(),
        };

        match self.store.invalidate(code_id, &invalidation).await? {
            Some(invalidated) => {
                info!(
                    code_id = %code_id,
                    registration_id = invalidated.registration_id,
                    reason = %reason,
                    actor = %actor,
                    "Access code invalidated"
                );
                Ok(invalidated)
            }
            None => {
                let status = self
                    .store
                    .find_by_id(code_id)
                    .await?
                    .map(|c| c.status)
                    .unwrap_or(code.status);
                Err(CodeError::CodeNotActive { code_id, status })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CodeStatus, ReasonCode, ScanContext, ScanOutcome, ScanPolicy};
    use crate::services::clock::ManualClock;
    use crate::services::issuer::{IssueOptions, IssuerPolicy};
    use crate::services::memory::{
        InMemoryAccessCodeStore, InMemoryAttendanceRecorder, InMemoryScanAttemptLog,
        StaticRegistrationDirectory,
    };
    use crate::services::scan_validator::ScanValidator;
    use chrono::{Duration, TimeZone};

    struct Harness {
        coordinator: RegenerationCoordinator,
        issuer: Arc<CodeIssuer>,
        validator: ScanValidator,
        store: Arc<InMemoryAccessCodeStore>,
        registrations: Arc<StaticRegistrationDirectory>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryAccessCodeStore::new());
        let registrations = Arc::new(StaticRegistrationDirectory::new());
        registrations.approve(123, 7, None);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let issuer = Arc::new(CodeIssuer::new(
            store.clone(),
            registrations.clone(),
            clock.clone(),
            IssuerPolicy::default(),
        ));
        let attempts = Arc::new(InMemoryScanAttemptLog::new());
        let validator = ScanValidator::new(
            store.clone(),
            attempts,
            Arc::new(InMemoryAttendanceRecorder::new()),
            None,
            clock.clone(),
        );
        let coordinator = RegenerationCoordinator::new(store.clone(), issuer.clone(), clock.clone());
        Harness {
            coordinator,
            issuer,
            validator,
            store,
            registrations,
            clock,
        }
    }

    #[tokio::test]
    async fn test_regenerate_invalidates_predecessor() {
        let h = harness();
        let original = h.issuer.issue(123, IssueOptions::default()).await.unwrap();

        let result = h
            .coordinator
            .regenerate(123, "compromised", None, "admin")
            .await
            .unwrap();

        assert_eq!(result.old_code.id, original.code.id);
        assert_eq!(result.old_code.status, CodeStatus::Invalidated);
        assert_eq!(
            result.old_code.invalidation_reason.as_deref(),
            Some("compromised")
        );
        assert_eq!(result.old_code.invalidated_by.as_deref(), Some("admin"));
        assert_eq!(result.new_code.code.status, CodeStatus::Active);
        assert_ne!(result.new_code.token, original.token);
        assert_eq!(result.new_code.code.replaces_code_id, Some(original.code.id));
        assert_eq!(h.store.active_count_for(123), 1);

        let ctx = ScanContext::new("gate-a");
        let old = h
            .validator
            .validate(&original.token, 7, ctx.clone(), false)
            .await
            .unwrap();
        assert_eq!(old.outcome, ScanOutcome::Denied(ReasonCode::QrInvalidated));

        let new = h
            .validator
            .validate(&result.new_code.token, 7, ctx, false)
            .await
            .unwrap();
        assert!(new.is_granted());
    }

    #[tokio::test]
    async fn test_regenerate_without_active_code() {
        let h = harness();
        let err = h
            .coordinator
            .regenerate(123, "lost", None, "admin")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACTIVE_CODE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_regenerate_copies_policy_and_metadata() {
        let h = harness();
        h.issuer
            .issue(
                123,
                IssueOptions {
                    metadata: Some(serde_json::json!({"tier": "vip"})),
                    scan_policy: Some(ScanPolicy::MultiUse),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let result = h
            .coordinator
            .regenerate(123, "reprint", None, "admin")
            .await
            .unwrap();
        assert_eq!(result.new_code.code.scan_policy, ScanPolicy::MultiUse);
        assert_eq!(result.new_code.code.metadata["tier"], "vip");
    }

    #[tokio::test]
    async fn test_regenerate_rejects_past_expiry_without_side_effects() {
        let h = harness();
        let original = h.issuer.issue(123, IssueOptions::default()).await.unwrap();

        let err = h
            .coordinator
            .regenerate(123, "reprint", Some(h.clock.now() - Duration::hours(1)), "admin")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_EXPIRY");

        let stored = h.store.find_by_id(original.code.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CodeStatus::Active);
    }

    #[tokio::test]
    async fn test_regenerate_requires_approval() {
        let h = harness();
        h.issuer.issue(123, IssueOptions::default()).await.unwrap();
        h.registrations.register_pending(123, 7);

        let err = h
            .coordinator
            .regenerate(123, "reprint", None, "admin")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REGISTRATION_NOT_APPROVED");
        assert_eq!(h.store.active_count_for(123), 1);
    }

    #[tokio::test]
    async fn test_repeated_regeneration_keeps_single_active() {
        let h = harness();
        h.issuer.issue(123, IssueOptions::default()).await.unwrap();
        for _ in 0..5 {
            h.coordinator
                .regenerate(123, "again", None, "admin")
                .await
                .unwrap();
            assert_eq!(h.store.active_count_for(123), 1);
        }
        let history = h.store.list_for_registration(123).await.unwrap();
        assert_eq!(history.len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_regeneration_single_winner() {
        let h = Arc::new(harness());
        h.issuer.issue(123, IssueOptions::default()).await.unwrap();

        let a = {
            let h = h.clone();
            tokio::spawn(async move { h.coordinator.regenerate(123, "a", None, "x").await })
        };
        let b = {
            let h = h.clone();
            tokio::spawn(async move { h.coordinator.regenerate(123, "b", None, "y").await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert!(results.iter().any(|r| r.is_ok()));
        assert_eq!(h.store.active_count_for(123), 1);
    }

    #[tokio::test]
    async fn test_invalidate_active_code() {
        let h = harness();
        let issued = h.issuer.issue(123, IssueOptions::default()).await.unwrap();

        let code = h
            .coordinator
            .invalidate(issued.code.id, "fraud", "admin")
            .await
            .unwrap();
        assert_eq!(code.status, CodeStatus::Invalidated);
        assert!(code.invalidated_at.is_some());

        let err = h
            .coordinator
            .invalidate(issued.code.id, "fraud", "admin")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CodeError::CodeNotActive {
                status: CodeStatus::Invalidated,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalidate_unknown_and_used() {
        let h = harness();
        let err = h
            .coordinator
            .invalidate(Uuid::new_v4(), "x", "admin")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CODE_NOT_FOUND");

        let issued = h.issuer.issue(123, IssueOptions::default()).await.unwrap();
        h.validator
            .validate(&issued.token, 7, ScanContext::new("gate"), false)
            .await
            .unwrap();
        let err = h
            .coordinator
            .invalidate(issued.code.id, "x", "admin")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CODE_NOT_ACTIVE");
    }
}
