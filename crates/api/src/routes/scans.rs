//! Scan validation endpoint used by access point hardware.

use axum::{
    extract::{Query, State},
    Json,
};
use std::time::{Duration, Instant};
use validator::Validate;

use domain::errors::ScanError;
use domain::models::scan_attempt::{ValidateScanQuery, ValidateScanRequest, ValidationResponse};
use domain::services::ValidationResult;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::metrics::{record_scan_duration, record_scan_failure, record_scan_outcome};

const GRANTED_MESSAGE: &str = "Access granted";

/// Validate a presented token at an access point.
///
/// POST /api/v1/scans/validate?dryRun=
///
/// Grants and business denials both answer 200; the body's `reason` is the
/// machine-readable verdict. Malformed tokens answer 400, throttled access
/// points 429, and undecidable scans 503 with `retryable: true`.
pub async fn validate_scan(
    State(state): State<AppState>,
    Query(query): Query<ValidateScanQuery>,
    Json(request): Json<ValidateScanRequest>,
) -> Result<Json<ValidationResponse>, ApiError> {
    request.validate()?;

    if let Err(retry_after_secs) = state.rate_limiter.check(&request.access_point) {
        record_scan_failure("rate_limited");
        tracing::info!(access_point = %request.access_point, "Scan rate limited");
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    let start = Instant::now();
    let timeout = Duration::from_millis(state.config.access_codes.scan_timeout_ms);
    let dry_run = query.dry_run;
    let access = state.access.clone();

    // Detached so a timed-out request never abandons a half-applied scan
    let task = tokio::spawn(async move {
        if dry_run {
            access
                .check(&request.token, request.event_id, request.verify_integrity)
                .await
        } else {
            let context = request.context();
            access
                .validate(
                    &request.token,
                    request.event_id,
                    context,
                    request.verify_integrity,
                )
                .await
        }
    });

    let outcome = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_error)) => {
            record_scan_failure("panic");
            return Err(ApiError::Internal(format!(
                "scan validation task failed: {}",
                join_error
            )));
        }
        Err(_) => {
            record_scan_failure("timeout");
            return Err(ApiError::ServiceUnavailable(format!(
                "scan validation exceeded {}ms",
                timeout.as_millis()
            )));
        }
    };
    record_scan_duration(start.elapsed().as_secs_f64());

    match outcome {
        Ok(result) => {
            record_scan_outcome(&result.outcome, result.dry_run);
            Ok(Json(to_response(result)))
        }
        Err(err) => {
            record_scan_failure(match err {
                ScanError::InvalidHashFormat => "invalid_format",
                ScanError::Store(_) => "store",
            });
            Err(err.into())
        }
    }
}

fn to_response(result: ValidationResult) -> ValidationResponse {
    let granted = result.is_granted();
    let review_required = result.review_required();
    let reason = result.outcome.reason();
    let message = reason
        .map(|r| r.message())
        .unwrap_or(GRANTED_MESSAGE)
        .to_string();
    let code = result.code;

    ValidationResponse {
        is_valid: granted,
        reason,
        message,
        registration_id: code.as_ref().map(|c| c.registration_id),
        code_id: code.as_ref().map(|c| c.id),
        usage_count: code.as_ref().map(|c| c.usage_count),
        metadata: code.filter(|_| granted).map(|c| c.metadata),
        integrity: result.integrity,
        review_required,
        dry_run: result.dry_run,
    }
}
