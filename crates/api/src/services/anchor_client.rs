//! HTTP client for the external integrity anchoring service.
//!
//! Contract:
//! - `POST {url}/anchors` with `{"fingerprint": "..."}` returns `{"receiptId", "anchoredAt"}`.
//!   The receipt is the service's own reference and may be any string.
//! - `GET {url}/anchors/{fingerprint}` returns `{"anchored", "anchoredAt", "tamperEvidence"}`;
//!   404 means the fingerprint is not (yet) anchored.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use domain::errors::AnchorError;
use domain::models::{AnchorReceipt, AnchorVerification};
use domain::services::IntegrityAnchor;

use crate::config::AnchorConfig;

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Opens after a run of consecutive failures; lets a probe through after the
/// reset timeout.
struct CircuitBreaker {
    is_open: AtomicBool,
    failure_count: AtomicU32,
    failure_threshold: u32,
    reset_timeout: Duration,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            is_open: AtomicBool::new(false),
            failure_count: AtomicU32::new(0),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            opened_at: RwLock::new(None),
        }
    }

    async fn is_allowed(&self) -> bool {
        self.state().await != CircuitState::Open
    }

    async fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        if self.is_open.swap(false, Ordering::Relaxed) {
            info!("Anchor circuit breaker closed");
            *self.opened_at.write().await = None;
        }
    }

    async fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count < self.failure_threshold {
            return;
        }
        let was_open = self.is_open.swap(true, Ordering::Relaxed);
        // A failed half-open probe restarts the reset window
        *self.opened_at.write().await = Some(Instant::now());
        if !was_open {
            warn!(
                failure_count = count,
                threshold = self.failure_threshold,
                "Anchor circuit breaker opened"
            );
        }
    }

    async fn state(&self) -> CircuitState {
        if !self.is_open.load(Ordering::Relaxed) {
            return CircuitState::Closed;
        }
        match *self.opened_at.read().await {
            Some(opened) if opened.elapsed() >= self.reset_timeout => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnchorRequest<'a> {
    fingerprint: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnchorResponse {
    #[serde(alias = "anchorHash", alias = "txHash")]
    receipt_id: String,
    anchored_at: DateTime<Utc>,
}

// ============================================================================
// Client
// ============================================================================

/// `IntegrityAnchor` backed by the HTTP anchoring service.
pub struct HttpAnchorClient {
    client: Client,
    base_url: String,
    enabled: bool,
    circuit_breaker: CircuitBreaker,
}

impl HttpAnchorClient {
    pub fn new(config: &AnchorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            enabled: config.enabled && !config.url.is_empty(),
            circuit_breaker: CircuitBreaker::new(
                config.circuit_breaker_failures,
                Duration::from_secs(config.circuit_breaker_reset_secs),
            ),
        })
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state().await
    }

    async fn guarded<T, F>(&self, operation: &'static str, call: F) -> Result<T, AnchorError>
    where
        F: std::future::Future<Output = Result<T, AnchorError>>,
    {
        if !self.enabled {
            return Err(AnchorError::Disabled);
        }
        if !self.circuit_breaker.is_allowed().await {
            counter!("anchor_requests_total", "operation" => operation, "result" => "circuit_open")
                .increment(1);
            return Err(AnchorError::CircuitOpen);
        }

        let result = call.await;
        match &result {
            Ok(_) => {
                self.circuit_breaker.record_success().await;
                counter!("anchor_requests_total", "operation" => operation, "result" => "ok")
                    .increment(1);
            }
            // A rejection means the service is up; it does not trip the breaker
            Err(AnchorError::Rejected(_)) => {
                counter!("anchor_requests_total", "operation" => operation, "result" => "rejected")
                    .increment(1);
            }
            Err(e) => {
                self.circuit_breaker.record_failure().await;
                counter!("anchor_requests_total", "operation" => operation, "result" => "error")
                    .increment(1);
                debug!(operation, error = %e, "Anchor request failed");
            }
        }
        result
    }
}

fn transport_error(err: reqwest::Error) -> AnchorError {
    if err.is_timeout() {
        AnchorError::Timeout
    } else {
        AnchorError::Unavailable(err.to_string())
    }
}

async fn status_error(response: reqwest::Response) -> AnchorError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        AnchorError::Rejected(format!("HTTP {}: {}", status, body))
    } else {
        AnchorError::Unavailable(format!("HTTP {}: {}", status, body))
    }
}

#[async_trait::async_trait]
impl IntegrityAnchor for HttpAnchorClient {
    async fn anchor(&self, fingerprint: &str) -> Result<AnchorReceipt, AnchorError> {
        self.guarded("anchor", async {
            let response = self
                .client
                .post(format!("{}/anchors", self.base_url))
                .json(&AnchorRequest { fingerprint })
                .send()
                .await
                .map_err(transport_error)?;

            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            let body: AnchorResponse = response
                .json()
                .await
                .map_err(|e| AnchorError::Unavailable(format!("invalid response: {}", e)))?;

            Ok(AnchorReceipt {
                receipt_id: body.receipt_id,
                anchored_at: body.anchored_at,
            })
        })
        .await
    }

    async fn verify(&self, fingerprint: &str) -> Result<AnchorVerification, AnchorError> {
        self.guarded("verify", async {
            let response = self
                .client
                .get(format!("{}/anchors/{}", self.base_url, fingerprint))
                .send()
                .await
                .map_err(transport_error)?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(AnchorVerification {
                    anchored: false,
                    anchored_at: None,
                    tamper_evidence: false,
                });
            }
            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            response
                .json::<AnchorVerification>()
                .await
                .map_err(|e| AnchorError::Unavailable(format!("invalid response: {}", e)))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, url: &str) -> AnchorConfig {
        AnchorConfig {
            enabled,
            url: url.to_string(),
            timeout_ms: 200,
            circuit_breaker_failures: 2,
            circuit_breaker_reset_secs: 60,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.is_allowed().await);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.is_allowed().await);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_then_closes() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        assert!(breaker.is_allowed().await);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_disabled_client() {
        let client = HttpAnchorClient::new(&config(false, "http://anchor.invalid")).unwrap();
        let err = client.anchor("abc").await.unwrap_err();
        assert!(matches!(err, AnchorError::Disabled));
    }

    #[tokio::test]
    async fn test_unreachable_service_trips_breaker() {
        // Port 9 (discard) on localhost refuses connections in test environments
        let client = HttpAnchorClient::new(&config(true, "http://127.0.0.1:9")).unwrap();
        for _ in 0..2 {
            let err = client.verify("abc").await.unwrap_err();
            assert!(err.is_retryable());
        }
        assert_eq!(client.circuit_state().await, CircuitState::Open);
        assert!(matches!(
            client.verify("abc").await.unwrap_err(),
            AnchorError::CircuitOpen
        ));
    }

    #[test]
    fn test_anchor_response_accepts_ledger_reference() {
        let body: AnchorResponse = serde_json::from_str(
            r#"{"txHash": "0x9f2c", "anchoredAt": "2025-06-01T09:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(body.receipt_id, "0x9f2c");
    }

    #[test]
    fn test_circuit_state_labels() {
        assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
    }
}
