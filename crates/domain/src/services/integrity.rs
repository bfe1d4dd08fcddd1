//! Integrity anchoring coordinator.
//!
//! Anchoring runs beside the issuance and scan paths, never in front of them.
//! Every call to the external anchor is time-bounded; failures degrade to
//! [`AnchorStatus::Unknown`] instead of surfacing as errors.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::AnchorError;
use crate::models::{AccessCode, AnchorReceipt, AnchorStatus, AnchorVerification, IntegrityReport};

use super::ports::{AccessCodeStore, IntegrityAnchor};

/// Retry and timeout settings for anchor calls.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityPolicy {
    pub timeout: Duration,
    /// Verification budget on the scan path. Kept well below `timeout` so an
    /// access point never waits on a slow anchor.
    pub scan_budget: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            scan_budget: Duration::from_millis(250),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

/// Submits code fingerprints for anchoring and checks them later.
pub struct IntegrityCoordinator {
    anchor: Arc<dyn IntegrityAnchor>,
    store: Arc<dyn AccessCodeStore>,
    policy: IntegrityPolicy,
}

impl IntegrityCoordinator {
    pub fn new(
        anchor: Arc<dyn IntegrityAnchor>,
        store: Arc<dyn AccessCodeStore>,
        policy: IntegrityPolicy,
    ) -> Self {
        Self {
            anchor,
            store,
            policy,
        }
    }

    /// Anchor a code's fingerprint and persist it with the service receipt.
    pub async fn anchor_code(&self, code: &AccessCode) -> Result<AnchorReceipt, AnchorError> {
        let fingerprint = code.integrity_fingerprint();
        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1;

        let receipt = loop {
            let result = tokio::time::timeout(self.policy.timeout, self.anchor.anchor(&fingerprint))
                .await
                .unwrap_or(Err(AnchorError::Timeout));

            match result {
                Ok(receipt) => break receipt,
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    debug!(code_id = %code.id, attempt, error = %e, "Anchor attempt failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(code_id = %code.id, attempt, error = %e, "Anchoring failed");
                    return Err(e);
                }
            }
        };

        self.store
            .record_anchor(code.id, &fingerprint, &receipt)
            .await
            .map_err(|e| {
                warn!(code_id = %code.id, error = %e, "Failed to persist anchor receipt");
                AnchorError::Unavailable(e.to_string())
            })?;

        info!(code_id = %code.id, receipt_id = %receipt.receipt_id, "Access code anchored");
        Ok(receipt)
    }

    /// Anchor in the background. The caller never waits on the result.
    pub fn spawn_anchor(self: &Arc<Self>, code: AccessCode) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            // Failures are logged inside; the retry job picks the code up later
            let _ = coordinator.anchor_code(&code).await;
        })
    }

    /// Integrity status of a code. Never fails.
    pub async fn verify_code(&self, code: &AccessCode) -> AnchorStatus {
        self.verify_code_within(code, self.policy.timeout).await
    }

    /// Integrity status within the scan-path budget.
    pub async fn verify_for_scan(&self, code: &AccessCode) -> AnchorStatus {
        let budget = self.policy.scan_budget.min(self.policy.timeout);
        self.verify_code_within(code, budget).await
    }

    /// Integrity status, giving up as [`AnchorStatus::Unknown`] after `budget`.
    pub async fn verify_code_within(&self, code: &AccessCode, budget: Duration) -> AnchorStatus {
        let Some(anchor_hash) = code.anchor_hash.as_deref() else {
            return AnchorStatus::Pending;
        };

        // Stored row drifted from what was anchored
        if code.integrity_fingerprint() != anchor_hash {
            warn!(code_id = %code.id, "Access code fingerprint does not match its anchor");
            return AnchorStatus::Mismatched;
        }

        let result = tokio::time::timeout(budget, self.anchor.verify(anchor_hash))
            .await
            .unwrap_or(Err(AnchorError::Timeout));

        match result {
            Ok(verification) => classify(&verification),
            Err(e) => {
                debug!(code_id = %code.id, error = %e, "Anchor verification unavailable");
                AnchorStatus::Unknown
            }
        }
    }

    /// Full integrity report for a code.
    pub async fn report(&self, code: &AccessCode) -> IntegrityReport {
        IntegrityReport {
            code_id: code.id,
            status: self.verify_code(code).await,
            fingerprint: code.integrity_fingerprint(),
            anchor_hash: code.anchor_hash.clone(),
            anchor_receipt: code.anchor_receipt.clone(),
            anchored_at: code.anchored_at,
        }
    }
}

fn classify(verification: &AnchorVerification) -> AnchorStatus {
    if verification.tamper_evidence {
        AnchorStatus::Mismatched
    } else if verification.anchored {
        AnchorStatus::Confirmed
    } else {
        AnchorStatus::Pending
    }
}

// ============================================================================
// Mock anchor
// ============================================================================

/// Mock anchor for development and testing.
///
/// Remembers anchored hashes in memory. Can simulate outages and slow
/// responses.
#[derive(Debug, Default)]
pub struct MockIntegrityAnchor {
    anchored: std::sync::RwLock<std::collections::HashMap<String, DateTime<Utc>>>,
    simulate_failure: AtomicBool,
    delay_ms: AtomicU32,
}

impl MockIntegrityAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock anchor that simulates failures.
    pub fn failing() -> Self {
        let anchor = Self::default();
        anchor.simulate_failure.store(true, Ordering::SeqCst);
        anchor
    }

    pub fn set_failing(&self, failing: bool) {
        self.simulate_failure.store(failing, Ordering::SeqCst);
    }

    /// Delay every response, to exercise timeouts.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis().min(u32::MAX as u128) as u32, Ordering::SeqCst);
    }

    pub fn anchored_count(&self) -> usize {
        self.anchored.read().map(|a| a.len()).unwrap_or(0)
    }

    async fn simulate(&self) -> Result<(), AnchorError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        if self.simulate_failure.load(Ordering::SeqCst) {
            warn!("Mock anchor simulating failure");
            return Err(AnchorError::Unavailable("Simulated failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IntegrityAnchor for MockIntegrityAnchor {
    async fn anchor(&self, fingerprint: &str) -> Result<AnchorReceipt, AnchorError> {
        self.simulate().await?;
        let anchored_at = Utc::now();
        self.anchored
            .write()
            .map_err(|_| AnchorError::Unavailable("lock poisoned".to_string()))?
            .insert(fingerprint.to_string(), anchored_at);
        debug!(fingerprint = %fingerprint, "Mock: anchored fingerprint");
        Ok(AnchorReceipt {
            receipt_id: format!("mock-{}", uuid::Uuid::new_v4()),
            anchored_at,
        })
    }

    async fn verify(&self, fingerprint: &str) -> Result<AnchorVerification, AnchorError> {
        self.simulate().await?;
        let anchored_at = self
            .anchored
            .read()
            .map_err(|_| AnchorError::Unavailable("lock poisoned".to_string()))?
            .get(fingerprint)
            .copied();
        Ok(AnchorVerification {
            anchored: anchored_at.is_some(),
            anchored_at,
            tamper_evidence: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::access_code::tests::sample_code;
    use crate::services::memory::InMemoryAccessCodeStore;

    fn fast_policy() -> IntegrityPolicy {
        IntegrityPolicy {
            timeout: Duration::from_millis(50),
            scan_budget: Duration::from_millis(20),
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
        }
    }

    async fn setup() -> (
        IntegrityCoordinator,
        Arc<MockIntegrityAnchor>,
        Arc<InMemoryAccessCodeStore>,
        AccessCode,
    ) {
        let anchor = Arc::new(MockIntegrityAnchor::new());
        let store = Arc::new(InMemoryAccessCodeStore::new());
        let code = sample_code(Utc::now());
        store.insert(&code).await.unwrap();
        let coordinator = IntegrityCoordinator::new(anchor.clone(), store.clone(), fast_policy());
        (coordinator, anchor, store, code)
    }

    #[tokio::test]
    async fn test_unanchored_code_is_pending() {
        let (coordinator, _, _, code) = setup().await;
        assert_eq!(coordinator.verify_code(&code).await, AnchorStatus::Pending);
    }

    #[tokio::test]
    async fn test_anchor_then_verify_confirms() {
        let (coordinator, anchor, store, code) = setup().await;
        let receipt = coordinator.anchor_code(&code).await.unwrap();
        assert_eq!(anchor.anchored_count(), 1);

        let stored = store.find_by_id(code.id).await.unwrap().unwrap();
        let fingerprint = code.integrity_fingerprint();
        assert_eq!(stored.anchor_hash.as_deref(), Some(fingerprint.as_str()));
        assert_eq!(stored.anchor_receipt.as_deref(), Some(receipt.receipt_id.as_str()));
        assert_eq!(coordinator.verify_code(&stored).await, AnchorStatus::Confirmed);
    }

    /// Anchor that answers with its own ledger reference instead of echoing
    /// the submitted fingerprint.
    #[derive(Default)]
    struct LedgerAnchor {
        submitted: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl IntegrityAnchor for LedgerAnchor {
        async fn anchor(&self, fingerprint: &str) -> Result<AnchorReceipt, AnchorError> {
            self.submitted.lock().unwrap().push(fingerprint.to_string());
            Ok(AnchorReceipt {
                receipt_id: format!("0x{}", "ab".repeat(40)),
                anchored_at: Utc::now(),
            })
        }

        async fn verify(&self, fingerprint: &str) -> Result<AnchorVerification, AnchorError> {
            let anchored = self
                .submitted
                .lock()
                .unwrap()
                .iter()
                .any(|f| f == fingerprint);
            Ok(AnchorVerification {
                anchored,
                anchored_at: None,
                tamper_evidence: false,
            })
        }
    }

    #[tokio::test]
    async fn test_ledger_receipt_still_confirms_untouched_code() {
        let anchor = Arc::new(LedgerAnchor::default());
        let store = Arc::new(InMemoryAccessCodeStore::new());
        let code = sample_code(Utc::now());
        store.insert(&code).await.unwrap();
        let coordinator = IntegrityCoordinator::new(anchor, store.clone(), fast_policy());

        let receipt = coordinator.anchor_code(&code).await.unwrap();
        assert_ne!(receipt.receipt_id, code.integrity_fingerprint());

        let stored = store.find_by_id(code.id).await.unwrap().unwrap();
        assert_eq!(
            stored.anchor_hash.as_deref(),
            Some(code.integrity_fingerprint().as_str())
        );
        assert_eq!(stored.anchor_receipt.as_deref(), Some(receipt.receipt_id.as_str()));
        assert_eq!(coordinator.verify_code(&stored).await, AnchorStatus::Confirmed);

        let report = coordinator.report(&stored).await;
        assert_eq!(report.status, AnchorStatus::Confirmed);
        assert_eq!(report.anchor_receipt, Some(receipt.receipt_id));
    }

    #[tokio::test]
    async fn test_tampered_row_is_mismatched() {
        let (coordinator, _, store, code) = setup().await;
        coordinator.anchor_code(&code).await.unwrap();

        let mut tampered = store.find_by_id(code.id).await.unwrap().unwrap();
        tampered.expires_at = tampered.expires_at + chrono::Duration::days(30);
        assert_eq!(
            coordinator.verify_code(&tampered).await,
            AnchorStatus::Mismatched
        );
    }

    #[tokio::test]
    async fn test_outage_degrades_to_unknown() {
        let (coordinator, anchor, store, code) = setup().await;
        coordinator.anchor_code(&code).await.unwrap();
        let stored = store.find_by_id(code.id).await.unwrap().unwrap();

        anchor.set_failing(true);
        assert_eq!(coordinator.verify_code(&stored).await, AnchorStatus::Unknown);
    }

    #[tokio::test]
    async fn test_slow_anchor_times_out_to_unknown() {
        let (coordinator, anchor, store, code) = setup().await;
        coordinator.anchor_code(&code).await.unwrap();
        let stored = store.find_by_id(code.id).await.unwrap().unwrap();

        anchor.set_delay(Duration::from_millis(500));
        assert_eq!(coordinator.verify_code(&stored).await, AnchorStatus::Unknown);
    }

    #[tokio::test]
    async fn test_scan_budget_caps_verification_wait() {
        let anchor = Arc::new(MockIntegrityAnchor::new());
        let store = Arc::new(InMemoryAccessCodeStore::new());
        let code = sample_code(Utc::now());
        store.insert(&code).await.unwrap();
        let coordinator = IntegrityCoordinator::new(
            anchor.clone(),
            store.clone(),
            IntegrityPolicy {
                timeout: Duration::from_secs(5),
                scan_budget: Duration::from_millis(20),
                ..fast_policy()
            },
        );
        coordinator.anchor_code(&code).await.unwrap();
        let stored = store.find_by_id(code.id).await.unwrap().unwrap();

        anchor.set_delay(Duration::from_secs(2));
        let started = std::time::Instant::now();
        assert_eq!(coordinator.verify_for_scan(&stored).await, AnchorStatus::Unknown);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failed_anchoring_leaves_code_unanchored() {
        let (coordinator, anchor, store, code) = setup().await;
        anchor.set_failing(true);

        let err = coordinator.anchor_code(&code).await.unwrap_err();
        assert!(matches!(err, AnchorError::Unavailable(_)));
        let stored = store.find_by_id(code.id).await.unwrap().unwrap();
        assert!(stored.anchor_hash.is_none());
    }

    #[test]
    fn test_classify_verification() {
        let base = AnchorVerification {
            anchored: true,
            anchored_at: None,
            tamper_evidence: false,
        };
        assert_eq!(classify(&base), AnchorStatus::Confirmed);
        assert_eq!(
            classify(&AnchorVerification {
                tamper_evidence: true,
                ..base.clone()
            }),
            AnchorStatus::Mismatched
        );
        assert_eq!(
            classify(&AnchorVerification {
                anchored: false,
                ..base
            }),
            AnchorStatus::Pending
        );
    }
}
