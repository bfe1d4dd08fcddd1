//! Access code lifecycle and query endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use domain::models::access_code::{
    AccessCodeResponse, CodeStatsResponse, InvalidateCodeRequest, InvalidateCodeResponse,
    IssueCodeRequest, IssuedCodeResponse, RegenerateCodeRequest, RegenerateCodeResponse,
    RegistrationCodesResponse,
};
use domain::models::scan_attempt::{
    CursorPagination, ListScanAttemptsQuery, ListScanAttemptsResponse, ScanAttemptResponse,
};
use domain::models::IntegrityReport;
use domain::services::{IssueOptions, IssuedCode};
use shared::pagination::{clamp_limit, decode_cursor, encode_cursor};

use crate::app::AppState;
use crate::error::ApiError;
use crate::extractors::ApiKeyAuth;
use crate::middleware::metrics::record_code_lifecycle;

fn issued_response(issued: IssuedCode) -> IssuedCodeResponse {
    IssuedCodeResponse {
        code_id: issued.code.id,
        token: issued.token,
        registration_id: issued.code.registration_id,
        event_id: issued.code.event_id,
        expires_at: issued.code.expires_at,
        status: issued.code.status,
        scan_policy: issued.code.scan_policy,
    }
}

/// Issue an access code for an approved registration.
///
/// POST /api/v1/codes
pub async fn issue_code(
    State(state): State<AppState>,
    auth: ApiKeyAuth,
    Json(request): Json<IssueCodeRequest>,
) -> Result<(StatusCode, Json<IssuedCodeResponse>), ApiError> {
    request.validate()?;

    let issued = state
        .access
        .issue(
            request.registration_id,
            IssueOptions {
                expires_at: request.expires_at,
                metadata: request.metadata,
                scan_policy: request.scan_policy,
            },
        )
        .await?;

    record_code_lifecycle("issued");
    info!(
        code_id = %issued.code.id,
        registration_id = issued.code.registration_id,
        key_id = %auth.key_id,
        "Issued access code"
    );

    Ok((StatusCode::CREATED, Json(issued_response(issued))))
}

/// GET /api/v1/codes/:code_id
pub async fn get_code(
    State(state): State<AppState>,
    Path(code_id): Path<Uuid>,
) -> Result<Json<AccessCodeResponse>, ApiError> {
    let code = state.access.get_code(code_id).await?;
    Ok(Json(AccessCodeResponse::from_code(code, state.access.now())))
}

/// Revoke a single active code.
///
/// POST /api/v1/codes/:code_id/invalidate
pub async fn invalidate_code(
    State(state): State<AppState>,
    auth: ApiKeyAuth,
    Path(code_id): Path<Uuid>,
    Json(request): Json<InvalidateCodeRequest>,
) -> Result<Json<InvalidateCodeResponse>, ApiError> {
    request.validate()?;

    let code = state
        .access
        .invalidate(code_id, request.reason.trim(), &auth.actor())
        .await?;
    record_code_lifecycle("invalidated");

    Ok(Json(InvalidateCodeResponse {
        code_id: code.id,
        status: code.status,
        invalidated_at: code.invalidated_at,
    }))
}

/// Replace a registration's active code with a fresh one.
///
/// POST /api/v1/registrations/:registration_id/codes/regenerate
pub async fn regenerate_code(
    State(state): State<AppState>,
    auth: ApiKeyAuth,
    Path(registration_id): Path<i64>,
    Json(request): Json<RegenerateCodeRequest>,
) -> Result<(StatusCode, Json<RegenerateCodeResponse>), ApiError> {
    request.validate()?;

    let regenerated = state
        .access
        .regenerate(
            registration_id,
            request.reason.trim(),
            request.expires_at,
            &auth.actor(),
        )
        .await?;
    record_code_lifecycle("regenerated");

    let now = state.access.now();
    Ok((
        StatusCode::CREATED,
        Json(RegenerateCodeResponse {
            old_code: AccessCodeResponse::from_code(regenerated.old_code, now),
            new_code: issued_response(regenerated.new_code),
        }),
    ))
}

/// Every code ever issued to a registration, newest first.
///
/// GET /api/v1/registrations/:registration_id/codes
pub async fn list_registration_codes(
    State(state): State<AppState>,
    Path(registration_id): Path<i64>,
) -> Result<Json<RegistrationCodesResponse>, ApiError> {
    let now = state.access.now();
    let codes = state.access.codes_for_registration(registration_id).await?;

    Ok(Json(RegistrationCodesResponse {
        registration_id,
        data: codes
            .into_iter()
            .map(|code| AccessCodeResponse::from_code(code, now))
            .collect(),
    }))
}

/// Scan attempt log for a code, newest first.
///
/// GET /api/v1/codes/:code_id/scans?cursor=&limit=
pub async fn list_scan_attempts(
    State(state): State<AppState>,
    Path(code_id): Path<Uuid>,
    Query(query): Query<ListScanAttemptsQuery>,
) -> Result<Json<ListScanAttemptsResponse>, ApiError> {
    query.validate()?;

    let before = query
        .cursor
        .as_deref()
        .map(decode_cursor)
        .transpose()
        .map_err(|e| ApiError::validation(e.to_string()))?;
    let limit = clamp_limit(query.limit);

    let page = state.access.scan_attempts(code_id, before, limit).await?;

    let next_cursor = if page.has_more {
        page.attempts
            .last()
            .map(|last| encode_cursor(last.attempted_at, last.id))
    } else {
        None
    };

    Ok(Json(ListScanAttemptsResponse {
        data: page
            .attempts
            .into_iter()
            .map(ScanAttemptResponse::from)
            .collect(),
        pagination: CursorPagination {
            next_cursor,
            has_more: page.has_more,
        },
    }))
}

/// Integrity status of a code against its anchor.
///
/// GET /api/v1/codes/:code_id/integrity
pub async fn get_integrity(
    State(state): State<AppState>,
    Path(code_id): Path<Uuid>,
) -> Result<Json<IntegrityReport>, ApiError> {
    Ok(Json(state.access.integrity_report(code_id).await?))
}

/// Code counts by status for an event, with lazy expiry applied.
///
/// GET /api/v1/events/:event_id/stats
pub async fn event_stats(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
) -> Result<Json<CodeStatsResponse>, ApiError> {
    let stats = state.access.stats(event_id).await?;
    Ok(Json(CodeStatsResponse::new(event_id, stats)))
}
