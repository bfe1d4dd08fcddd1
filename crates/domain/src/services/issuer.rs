//! Code issuance.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{CodeError, StoreError};
use crate::models::access_code::{default_expiry, generate_token, hash_token};
use crate::models::{AccessCode, CodeStatus, ScanPolicy};

use super::clock::Clock;
use super::ports::{AccessCodeStore, EventBinding, RegistrationDirectory};

/// Token generation attempts before giving up on a collision.
const MAX_TOKEN_ATTEMPTS: usize = 2;

/// Issuance defaults.
#[derive(Debug, Clone, Copy)]
pub struct IssuerPolicy {
    /// Minimum validity window when the event ends sooner.
    pub default_validity: Duration,
    pub default_scan_policy: ScanPolicy,
}

impl Default for IssuerPolicy {
    fn default() -> Self {
        Self {
            default_validity: Duration::hours(24),
            default_scan_policy: ScanPolicy::SingleUse,
        }
    }
}

/// Optional overrides for a single issuance.
#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub scan_policy: Option<ScanPolicy>,
}

/// A freshly minted code together with its one-time visible token.
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub code: AccessCode,
    pub token: String,
}

/// Resolve the expiry for a new code.
///
/// An explicit override must be strictly after `now`. Without one, the code
/// lives until the later of the event end and `now + window`.
pub fn resolve_expiry(
    now: DateTime<Utc>,
    event_ends_at: Option<DateTime<Utc>>,
    requested: Option<DateTime<Utc>>,
    window: Duration,
) -> Result<DateTime<Utc>, CodeError> {
    match requested {
        Some(at) => {
            let at = at.trunc_subsecs(6);
            if at <= now {
                return Err(CodeError::InvalidExpiry);
            }
            Ok(at)
        }
        None => Ok(default_expiry(now, event_ends_at, window)),
    }
}

/// Issues access codes for approved registrations.
pub struct CodeIssuer {
    store: Arc<dyn AccessCodeStore>,
    registrations: Arc<dyn RegistrationDirectory>,
    clock: Arc<dyn Clock>,
    policy: IssuerPolicy,
}

impl CodeIssuer {
    pub fn new(
        store: Arc<dyn AccessCodeStore>,
        registrations: Arc<dyn RegistrationDirectory>,
        clock: Arc<dyn Clock>,
        policy: IssuerPolicy,
    ) -> Self {
        Self {
            store,
            registrations,
            clock,
            policy,
        }
    }

    /// Issue the first active code for a registration.
    pub async fn issue(
        &self,
        registration_id: i64,
        options: IssueOptions,
    ) -> Result<IssuedCode, CodeError> {
        let now = self.clock.now();
        let binding = self.approved_binding(registration_id).await?;

        if let Some(existing) = self
            .store
            .find_active_for_registration(registration_id)
            .await?
        {
            if !existing.is_logically_expired(now) {
                return Err(CodeError::CodeAlreadyExists(registration_id));
            }
            // Free the active slot held by a lapsed code
            self.store.mark_expired(existing.id, now).await?;
            debug!(
                code_id = %existing.id,
                registration_id,
                "Persisted lazy expiry before issuance"
            );
        }

        let expires_at = resolve_expiry(
            now,
            binding.ends_at,
            options.expires_at,
            self.policy.default_validity,
        )?;

        let issued = self
            .mint(
                registration_id,
                binding.event_id,
                expires_at,
                options.scan_policy.unwrap_or(self.policy.default_scan_policy),
                options.metadata.unwrap_or_else(|| serde_json::json!({})),
                None,
                now,
            )
            .await?;

        self.store.insert(&issued.code).await.map_err(|e| match e {
            StoreError::DuplicateToken => CodeError::TokenCollision,
            StoreError::ActiveCodeExists => CodeError::CodeAlreadyExists(registration_id),
            other => CodeError::Store(other),
        })?;

        info!(
            code_id = %issued.code.id,
            registration_id,
            event_id = issued.code.event_id,
            scan_policy = %issued.code.scan_policy,
            expires_at = %issued.code.expires_at,
            "Access code issued"
        );

        Ok(issued)
    }

    /// Build (without persisting) the successor of `previous`.
    ///
    /// The registration must still be approved. Scan policy and metadata are
    /// carried over.
    pub async fn prepare_replacement(
        &self,
        previous: &AccessCode,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedCode, CodeError> {
        let now = self.clock.now();
        let binding = self.approved_binding(previous.registration_id).await?;
        let expires_at = resolve_expiry(
            now,
            binding.ends_at,
            expires_at,
            self.policy.default_validity,
        )?;

        self.mint(
            previous.registration_id,
            previous.event_id,
            expires_at,
            previous.scan_policy,
            previous.metadata.clone(),
            Some(previous.id),
            now,
        )
        .await
    }

    async fn approved_binding(&self, registration_id: i64) -> Result<EventBinding, CodeError> {
        match self.registrations.is_approved(registration_id).await? {
            None => return Err(CodeError::RegistrationNotFound(registration_id)),
            Some(false) => return Err(CodeError::RegistrationNotApproved(registration_id)),
            Some(true) => {}
        }

        self.registrations
            .event_for(registration_id)
            .await?
            .ok_or(CodeError::RegistrationNotFound(registration_id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn mint(
        &self,
        registration_id: i64,
        event_id: i64,
        expires_at: DateTime<Utc>,
        scan_policy: ScanPolicy,
        metadata: serde_json::Value,
        replaces_code_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<IssuedCode, CodeError> {
        let (token, token_hash) = self.unique_token(registration_id, now).await?;

        let code = AccessCode {
            id: Uuid::new_v4(),
            registration_id,
            event_id,
            token_hash,
            status: CodeStatus::Active,
            scan_policy,
            issued_at: now,
            expires_at,
            usage_count: 0,
            last_used_at: None,
            invalidation_reason: None,
            invalidated_at: None,
            invalidated_by: None,
            replaces_code_id,
            metadata,
            anchor_hash: None,
            anchor_receipt: None,
            anchored_at: None,
        };

        Ok(IssuedCode { code, token })
    }

    async fn unique_token(
        &self,
        registration_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(String, String), CodeError> {
        for attempt in 1..=MAX_TOKEN_ATTEMPTS {
            let token = generate_token(registration_id, now);
            let token_hash = hash_token(&token);
            if !self.store.token_hash_exists(&token_hash).await? {
                return Ok((token, token_hash));
            }
            warn!(registration_id, attempt, "Generated token hash already exists");
        }
        Err(CodeError::TokenCollision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::ManualClock;
    use crate::services::memory::{InMemoryAccessCodeStore, StaticRegistrationDirectory};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    fn setup() -> (
        CodeIssuer,
        Arc<InMemoryAccessCodeStore>,
        Arc<StaticRegistrationDirectory>,
        Arc<ManualClock>,
    ) {
        let store = Arc::new(InMemoryAccessCodeStore::new());
        let registrations = Arc::new(StaticRegistrationDirectory::new());
        registrations.approve(123, 7, None);
        let clock = Arc::new(ManualClock::new(start()));
        let issuer = CodeIssuer::new(
            store.clone(),
            registrations.clone(),
            clock.clone(),
            IssuerPolicy::default(),
        );
        (issuer, store, registrations, clock)
    }

    #[test]
    fn test_resolve_expiry_rejects_past_and_present() {
        let now = start();
        let window = Duration::hours(1);
        assert!(matches!(
            resolve_expiry(now, None, Some(now), window),
            Err(CodeError::InvalidExpiry)
        ));
        assert!(matches!(
            resolve_expiry(now, None, Some(now - Duration::seconds(1)), window),
            Err(CodeError::InvalidExpiry)
        ));
        assert_eq!(
            resolve_expiry(now, None, Some(now + Duration::minutes(5)), window).unwrap(),
            now + Duration::minutes(5)
        );
    }

    #[tokio::test]
    async fn test_issue_persists_active_code() {
        let (issuer, store, _, clock) = setup();

        let issued = issuer.issue(123, IssueOptions::default()).await.unwrap();

        assert_eq!(issued.code.status, CodeStatus::Active);
        assert_eq!(issued.code.event_id, 7);
        assert_eq!(issued.code.token_hash, hash_token(&issued.token));
        assert_ne!(issued.code.token_hash, issued.token);
        assert_eq!(issued.code.expires_at, clock.now() + Duration::hours(24));
        assert!(issued.code.expires_at > issued.code.issued_at);

        let stored = store.find_by_id(issued.code.id).await.unwrap().unwrap();
        assert_eq!(stored, issued.code);
    }

    #[tokio::test]
    async fn test_issue_uses_event_end_when_later() {
        let (issuer, _, registrations, clock) = setup();
        let event_end = clock.now() + Duration::days(3);
        registrations.approve(200, 9, Some(event_end));

        let issued = issuer.issue(200, IssueOptions::default()).await.unwrap();
        assert_eq!(issued.code.expires_at, event_end);
    }

    #[tokio::test]
    async fn test_issue_twice_fails_with_code_already_exists() {
        let (issuer, _, _, _) = setup();
        issuer.issue(123, IssueOptions::default()).await.unwrap();

        let err = issuer
            .issue(123, IssueOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CODE_ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn test_issue_after_expiry_supersedes_lapsed_code() {
        let (issuer, store, _, clock) = setup();
        let first = issuer
            .issue(
                123,
                IssueOptions {
                    expires_at: Some(clock.now() + Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        clock.advance(Duration::hours(2));
        let second = issuer.issue(123, IssueOptions::default()).await.unwrap();

        let old = store.find_by_id(first.code.id).await.unwrap().unwrap();
        assert_eq!(old.status, CodeStatus::Expired);
        assert_eq!(second.code.status, CodeStatus::Active);
        assert_eq!(store.active_count_for(123), 1);
    }

    #[tokio::test]
    async fn test_issue_rejects_unapproved_and_unknown() {
        let (issuer, _, registrations, _) = setup();
        registrations.register_pending(55, 7);

        let err = issuer.issue(55, IssueOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "REGISTRATION_NOT_APPROVED");

        let err = issuer.issue(999, IssueOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "REGISTRATION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_issue_rejects_past_override() {
        let (issuer, store, _, clock) = setup();
        let err = issuer
            .issue(
                123,
                IssueOptions {
                    expires_at: Some(clock.now() - Duration::minutes(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_EXPIRY");
        assert_eq!(store.active_count_for(123), 0);
    }

    #[tokio::test]
    async fn test_issue_applies_overrides() {
        let (issuer, _, _, _) = setup();
        let issued = issuer
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
        assert_eq!(issued.code.scan_policy, ScanPolicy::MultiUse);
        assert_eq!(issued.code.metadata["tier"], "vip");
    }

    #[tokio::test]
    async fn test_issued_hashes_are_unique() {
        let (issuer, _, registrations, _) = setup();
        let mut hashes = std::collections::HashSet::new();
        for registration_id in 1000..1200 {
            registrations.approve(registration_id, 7, None);
            let issued = issuer
                .issue(registration_id, IssueOptions::default())
                .await
                .unwrap();
            assert!(hashes.insert(issued.code.token_hash));
        }
        assert_eq!(hashes.len(), 200);
    }

    #[tokio::test]
    async fn test_single_token_collision_regenerates() {
        let (issuer, store, _, _) = setup();
        store.force_token_collisions(1);

        let issued = issuer.issue(123, IssueOptions::default()).await.unwrap();

        assert_eq!(issued.code.token_hash, hash_token(&issued.token));
        assert_eq!(store.active_count_for(123), 1);
        assert_eq!(store.code_count(), 1);
    }

    #[tokio::test]
    async fn test_persistent_token_collision_fails_without_insert() {
        let (issuer, store, _, _) = setup();
        store.force_token_collisions(MAX_TOKEN_ATTEMPTS as u32);

        let err = issuer
            .issue(123, IssueOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CodeError::TokenCollision));
        assert_eq!(store.active_count_for(123), 0);
        assert_eq!(store.code_count(), 0);

        // The slot is still free once token generation succeeds
        issuer.issue(123, IssueOptions::default()).await.unwrap();
        assert_eq!(store.active_count_for(123), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_infrastructure_error() {
        let (issuer, store, _, _) = setup();
        store.set_unavailable(true);
        let err = issuer
            .issue(123, IssueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CodeError::Store(StoreError::Unavailable(_))));
    }
}
