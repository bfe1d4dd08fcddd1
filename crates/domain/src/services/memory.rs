//! In-memory adapters for the storage and collaborator ports.
//!
//! Used by service tests, HTTP tests, and local runs without Postgres. Every
//! conditional update runs under one write lock, which gives the same
//! at-most-once semantics as the conditional SQL in the Postgres adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{
    AccessCode, AnchorReceipt, CodeStats, CodeStatus, ScanAttempt, ScanOutcome, ScanPolicy,
};

use super::ports::{
    AccessCodeStore, AttendanceRecorder, EventBinding, Invalidation, RegistrationDirectory,
    ScanAttemptLog,
};

fn poisoned() -> StoreError {
    StoreError::Unavailable("lock poisoned".to_string())
}

fn check_available(flag: &AtomicBool) -> Result<(), StoreError> {
    if flag.load(Ordering::SeqCst) {
        return Err(StoreError::Unavailable("simulated outage".to_string()));
    }
    Ok(())
}

// ============================================================================
// Access codes
// ============================================================================

/// Access code store backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryAccessCodeStore {
    codes: RwLock<HashMap<Uuid, AccessCode>>,
    unavailable: AtomicBool,
    forced_collisions: AtomicU32,
}

impl InMemoryAccessCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Report the next `count` token hash lookups as already taken.
    pub fn force_token_collisions(&self, count: u32) {
        self.forced_collisions.store(count, Ordering::SeqCst);
    }

    /// Number of stored codes of any status.
    pub fn code_count(&self) -> usize {
        self.codes.read().map(|codes| codes.len()).unwrap_or(0)
    }

    /// Number of codes stored as `active` for a registration.
    pub fn active_count_for(&self, registration_id: i64) -> usize {
        self.codes
            .read()
            .map(|codes| {
                codes
                    .values()
                    .filter(|c| {
                        c.registration_id == registration_id && c.status == CodeStatus::Active
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Overwrite a stored code. Test hook for simulating tampering.
    pub fn overwrite(&self, code: AccessCode) {
        if let Ok(mut codes) = self.codes.write() {
            codes.insert(code.id, code);
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Uuid, AccessCode>>, StoreError> {
        check_available(&self.unavailable)?;
        self.codes.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Uuid, AccessCode>>, StoreError> {
        check_available(&self.unavailable)?;
        self.codes.write().map_err(|_| poisoned())
    }

    fn check_unique(
        codes: &HashMap<Uuid, AccessCode>,
        code: &AccessCode,
    ) -> Result<(), StoreError> {
        if codes.values().any(|c| c.token_hash == code.token_hash) {
            return Err(StoreError::DuplicateToken);
        }
        if code.status == CodeStatus::Active
            && codes.values().any(|c| {
                c.registration_id == code.registration_id && c.status == CodeStatus::Active
            })
        {
            return Err(StoreError::ActiveCodeExists);
        }
        Ok(())
    }

    fn apply_invalidation(code: &mut AccessCode, invalidation: &Invalidation) {
        code.status = CodeStatus::Invalidated;
        code.invalidation_reason = Some(invalidation.reason.clone());
        code.invalidated_at = Some(invalidation.at);
        code.invalidated_by = Some(invalidation.invalidated_by.clone());
    }
}

#[async_trait]
impl AccessCodeStore for InMemoryAccessCodeStore {
    async fn insert(&self, code: &AccessCode) -> Result<(), StoreError> {
        let mut codes = self.write()?;
        Self::check_unique(&codes, code)?;
        codes.insert(code.id, code.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AccessCode>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn find_by_token_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AccessCode>, StoreError> {
        Ok(self
            .read()?
            .values()
            .find(|c| c.token_hash == token_hash)
            .cloned())
    }

    async fn token_hash_exists(&self, token_hash: &str) -> Result<bool, StoreError> {
        let forced = self
            .forced_collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Ok(true);
        }
        Ok(self.read()?.values().any(|c| c.token_hash == token_hash))
    }

    async fn find_active_for_registration(
        &self,
        registration_id: i64,
    ) -> Result<Option<AccessCode>, StoreError> {
        Ok(self
            .read()?
            .values()
            .find(|c| c.registration_id == registration_id && c.status == CodeStatus::Active)
            .cloned())
    }

    async fn list_for_registration(
        &self,
        registration_id: i64,
    ) -> Result<Vec<AccessCode>, StoreError> {
        let mut codes: Vec<AccessCode> = self
            .read()?
            .values()
            .filter(|c| c.registration_id == registration_id)
            .cloned()
            .collect();
        codes.sort_by(|a, b| b.issued_at.cmp(&a.issued_at).then(b.id.cmp(&a.id)));
        Ok(codes)
    }

    async fn commit_scan(
        &self,
        id: Uuid,
        policy: ScanPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessCode>, StoreError> {
        let mut codes = self.write()?;
        let Some(code) = codes.get_mut(&id) else {
            return Ok(None);
        };

        let eligible = code.status == CodeStatus::Active
            && code.scan_policy == policy
            && now < code.expires_at
            && (policy == ScanPolicy::MultiUse || code.usage_count == 0);
        if !eligible {
            return Ok(None);
        }

        code.status = policy.status_after_scan();
        code.usage_count += 1;
        code.last_used_at = Some(now);
        Ok(Some(code.clone()))
    }

    async fn mark_expired(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut codes = self.write()?;
        match codes.get_mut(&id) {
            Some(code) if code.status == CodeStatus::Active && now >= code.expires_at => {
                code.status = CodeStatus::Expired;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate(
        &self,
        id: Uuid,
        invalidation: &Invalidation,
    ) -> Result<Option<AccessCode>, StoreError> {
        let mut codes = self.write()?;
        match codes.get_mut(&id) {
            Some(code) if code.status == CodeStatus::Active => {
                Self::apply_invalidation(code, invalidation);
                Ok(Some(code.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn replace_active(
        &self,
        old_id: Uuid,
        invalidation: &Invalidation,
        replacement: &AccessCode,
    ) -> Result<Option<AccessCode>, StoreError> {
        let mut codes = self.write()?;

        let mut old = match codes.get(&old_id) {
            Some(code) if code.status == CodeStatus::Active => code.clone(),
            _ => return Ok(None),
        };
        Self::apply_invalidation(&mut old, invalidation);

        // Validate the replacement against the state after invalidation so
        // nothing is written if either half fails.
        let mut staged = codes.clone();
        staged.insert(old.id, old.clone());
        Self::check_unique(&staged, replacement)?;

        codes.insert(old.id, old.clone());
        codes.insert(replacement.id, replacement.clone());
        Ok(Some(old))
    }

    async fn record_anchor(
        &self,
        id: Uuid,
        fingerprint: &str,
        receipt: &AnchorReceipt,
    ) -> Result<(), StoreError> {
        let mut codes = self.write()?;
        if let Some(code) = codes.get_mut(&id) {
            code.anchor_hash = Some(fingerprint.to_string());
            code.anchor_receipt = Some(receipt.receipt_id.clone());
            code.anchored_at = Some(receipt.anchored_at);
        }
        Ok(())
    }

    async fn list_unanchored(&self, limit: i64) -> Result<Vec<AccessCode>, StoreError> {
        let mut codes: Vec<AccessCode> = self
            .read()?
            .values()
            .filter(|c| c.status == CodeStatus::Active && c.anchor_hash.is_none())
            .cloned()
            .collect();
        codes.sort_by_key(|c| c.issued_at);
        codes.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(codes)
    }

    async fn stats_for_event(
        &self,
        event_id: i64,
        now: DateTime<Utc>,
    ) -> Result<CodeStats, StoreError> {
        let mut stats = CodeStats::default();
        for code in self.read()?.values().filter(|c| c.event_id == event_id) {
            stats.count(code.effective_status(now));
        }
        Ok(stats)
    }
}

// ============================================================================
// Scan attempts
// ============================================================================

/// Scan attempt log backed by a vector.
#[derive(Debug, Default)]
pub struct InMemoryScanAttemptLog {
    attempts: RwLock<Vec<ScanAttempt>>,
    unavailable: AtomicBool,
}

impl InMemoryScanAttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every attempt in append order.
    pub fn all(&self) -> Vec<ScanAttempt> {
        self.attempts
            .read()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ScanAttemptLog for InMemoryScanAttemptLog {
    async fn append(&self, attempt: &ScanAttempt) -> Result<(), StoreError> {
        check_available(&self.unavailable)?;
        self.attempts
            .write()
            .map_err(|_| poisoned())?
            .push(attempt.clone());
        Ok(())
    }

    async fn list_for_code(
        &self,
        code_id: Uuid,
        before: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ScanAttempt>, StoreError> {
        check_available(&self.unavailable)?;
        let mut attempts: Vec<ScanAttempt> = self
            .attempts
            .read()
            .map_err(|_| poisoned())?
            .iter()
            .filter(|a| a.code_id == Some(code_id))
            .filter(|a| match before {
                Some((at, id)) => (a.attempted_at, a.id) < (at, id),
                None => true,
            })
            .cloned()
            .collect();
        attempts.sort_by(|a, b| (b.attempted_at, b.id).cmp(&(a.attempted_at, a.id)));
        attempts.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(attempts)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        check_available(&self.unavailable)?;
        let mut attempts = self.attempts.write().map_err(|_| poisoned())?;
        let before = attempts.len();
        attempts.retain(|a| a.attempted_at >= cutoff);
        Ok((before - attempts.len()) as u64)
    }
}

// ============================================================================
// Registrations
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct RegistrationEntry {
    approved: bool,
    binding: EventBinding,
}

/// Registration directory seeded by hand.
#[derive(Debug, Default)]
pub struct StaticRegistrationDirectory {
    entries: RwLock<HashMap<i64, RegistrationEntry>>,
}

impl StaticRegistrationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) an approved registration for an event.
    pub fn approve(&self, registration_id: i64, event_id: i64, ends_at: Option<DateTime<Utc>>) {
        self.put(registration_id, true, EventBinding { event_id, ends_at });
    }

    /// Add a registration that exists but is not approved.
    pub fn register_pending(&self, registration_id: i64, event_id: i64) {
        self.put(
            registration_id,
            false,
            EventBinding {
                event_id,
                ends_at: None,
            },
        );
    }

    fn put(&self, registration_id: i64, approved: bool, binding: EventBinding) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(registration_id, RegistrationEntry { approved, binding });
        }
    }
}

#[async_trait]
impl RegistrationDirectory for StaticRegistrationDirectory {
    async fn is_approved(&self, registration_id: i64) -> Result<Option<bool>, StoreError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .get(&registration_id)
            .map(|e| e.approved))
    }

    async fn event_for(&self, registration_id: i64) -> Result<Option<EventBinding>, StoreError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .get(&registration_id)
            .map(|e| e.binding))
    }
}

// ============================================================================
// Attendance
// ============================================================================

/// Attendance recorder keyed by scan attempt id.
#[derive(Debug, Default)]
pub struct InMemoryAttendanceRecorder {
    recorded: RwLock<HashMap<Uuid, i64>>,
    log: Option<Arc<InMemoryScanAttemptLog>>,
    unavailable: AtomicBool,
}

impl InMemoryAttendanceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorder that can find granted attempts in `log` lacking attendance.
    pub fn with_log(log: Arc<InMemoryScanAttemptLog>) -> Self {
        Self {
            log: Some(log),
            ..Default::default()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of attendance rows.
    pub fn count(&self) -> usize {
        self.recorded.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether an attendance row exists for a scan attempt.
    pub fn is_recorded(&self, attempt_id: Uuid) -> bool {
        self.recorded
            .read()
            .map(|r| r.contains_key(&attempt_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl AttendanceRecorder for InMemoryAttendanceRecorder {
    async fn record_attendance(
        &self,
        registration_id: i64,
        attempt: &ScanAttempt,
    ) -> Result<(), StoreError> {
        check_available(&self.unavailable)?;
        self.recorded
            .write()
            .map_err(|_| poisoned())?
            .entry(attempt.id)
            .or_insert(registration_id);
        Ok(())
    }

    async fn find_unrecorded(&self, limit: i64) -> Result<Vec<ScanAttempt>, StoreError> {
        check_available(&self.unavailable)?;
        let Some(log) = &self.log else {
            return Ok(Vec::new());
        };
        let recorded = self.recorded.read().map_err(|_| poisoned())?;
        let mut pending: Vec<ScanAttempt> = log
            .all()
            .into_iter()
            .filter(|a| a.outcome == ScanOutcome::Granted && !recorded.contains_key(&a.id))
            .collect();
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }
}
