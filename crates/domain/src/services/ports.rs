//! Ports between the access-code services and their collaborators.
//!
//! Storage adapters live in the persistence crate (Postgres) and in
//! [`super::memory`] (tests, local runs).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{AnchorError, StoreError};
use crate::models::{
    AccessCode, AnchorReceipt, AnchorVerification, CodeStats, ScanAttempt, ScanPolicy,
};

/// Details recorded when a code is invalidated.
#[derive(Debug, Clone, PartialEq)]
pub struct Invalidation {
    pub reason: String,
    pub invalidated_by: String,
    pub at: DateTime<Utc>,
}

/// Event a registration belongs to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventBinding {
    pub event_id: i64,
    pub ends_at: Option<DateTime<Utc>>,
}

/// Persistent store of access codes.
///
/// Implementations must enforce two uniqueness rules: token hashes are
/// globally unique, and a registration has at most one `active` code.
#[async_trait]
pub trait AccessCodeStore: Send + Sync {
    async fn insert(&self, code: &AccessCode) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AccessCode>, StoreError>;

    async fn find_by_token_hash(&self, token_hash: &str)
        -> Result<Option<AccessCode>, StoreError>;

    async fn token_hash_exists(&self, token_hash: &str) -> Result<bool, StoreError>;

    async fn find_active_for_registration(
        &self,
        registration_id: i64,
    ) -> Result<Option<AccessCode>, StoreError>;

    /// All codes for a registration, newest first.
    async fn list_for_registration(
        &self,
        registration_id: i64,
    ) -> Result<Vec<AccessCode>, StoreError>;

    /// Atomically records a successful scan.
    ///
    /// Succeeds only if the code is still `active`, unexpired at `now`, and
    /// (for single-use) unscanned. Returns the updated code, or `None` when
    /// the condition no longer held.
    async fn commit_scan(
        &self,
        id: Uuid,
        policy: ScanPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessCode>, StoreError>;

    /// Persists lazy expiry. Only `active` codes past expiry are touched.
    async fn mark_expired(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Moves an `active` code to `invalidated`. Returns `None` if not active.
    async fn invalidate(
        &self,
        id: Uuid,
        invalidation: &Invalidation,
    ) -> Result<Option<AccessCode>, StoreError>;

    /// Invalidates `old_id` and inserts `replacement` as one atomic unit.
    ///
    /// Returns the invalidated old code, or `None` (and writes nothing) if
    /// `old_id` was no longer active.
    async fn replace_active(
        &self,
        old_id: Uuid,
        invalidation: &Invalidation,
        replacement: &AccessCode,
    ) -> Result<Option<AccessCode>, StoreError>;

    /// Store the submitted fingerprint as the code's anchor hash, with the
    /// service receipt beside it.
    async fn record_anchor(
        &self,
        id: Uuid,
        fingerprint: &str,
        receipt: &AnchorReceipt,
    ) -> Result<(), StoreError>;

    /// Codes still lacking an anchor, oldest first.
    async fn list_unanchored(&self, limit: i64) -> Result<Vec<AccessCode>, StoreError>;

    /// Counts by effective status at `now`.
    async fn stats_for_event(
        &self,
        event_id: i64,
        now: DateTime<Utc>,
    ) -> Result<CodeStats, StoreError>;
}

/// Append-only log of scan attempts.
#[async_trait]
pub trait ScanAttemptLog: Send + Sync {
    async fn append(&self, attempt: &ScanAttempt) -> Result<(), StoreError>;

    /// Attempts for a code, newest first, strictly before `before` when given.
    async fn list_for_code(
        &self,
        code_id: Uuid,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ScanAttempt>, StoreError>;

    /// Deletes attempts older than `cutoff`; returns how many were removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Read access to registrations owned by the surrounding platform.
#[async_trait]
pub trait RegistrationDirectory: Send + Sync {
    /// `None` when the registration does not exist.
    async fn is_approved(&self, registration_id: i64) -> Result<Option<bool>, StoreError>;

    async fn event_for(&self, registration_id: i64) -> Result<Option<EventBinding>, StoreError>;
}

/// Attendance side effect of a granted scan.
#[async_trait]
pub trait AttendanceRecorder: Send + Sync {
    /// Must be idempotent per scan attempt id.
    async fn record_attendance(
        &self,
        registration_id: i64,
        attempt: &ScanAttempt,
    ) -> Result<(), StoreError>;

    /// Granted attempts that have no attendance row yet.
    async fn find_unrecorded(&self, limit: i64) -> Result<Vec<ScanAttempt>, StoreError>;
}

/// External tamper-evidence anchor.
#[async_trait]
pub trait IntegrityAnchor: Send + Sync {
    async fn anchor(&self, fingerprint: &str) -> Result<AnchorReceipt, AnchorError>;

    /// Look up a previously submitted fingerprint.
    async fn verify(&self, fingerprint: &str) -> Result<AnchorVerification, AnchorError>;
}
