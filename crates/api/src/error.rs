use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use domain::errors::{CodeError, ScanError};
use domain::models::ReasonCode;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {message}")]
    NotFound { code: &'static str, message: String },

    #[error("Conflict: {message}")]
    Conflict { code: &'static str, message: String },

    #[error("Unprocessable: {message}")]
    Unprocessable { code: &'static str, message: String },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Vec<ValidationDetail>,
    },

    /// The presented token failed format checks before any lookup.
    #[error("Invalid token format")]
    InvalidTokenFormat,

    #[error("Rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),

    /// Infrastructure failure; the caller may retry.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            details: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<ValidationDetail>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationDetail {
    pub field: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = ErrorBody {
            error: String::new(),
            message: String::new(),
            retryable: false,
            retry_after: None,
            details: None,
        };

        let status = match self {
            ApiError::Unauthorized(msg) => {
                body.error = "UNAUTHORIZED".into();
                body.message = msg;
                StatusCode::UNAUTHORIZED
            }
            ApiError::NotFound { code, message } => {
                body.error = code.into();
                body.message = message;
                StatusCode::NOT_FOUND
            }
            ApiError::Conflict { code, message } => {
                body.error = code.into();
                body.message = message;
                StatusCode::CONFLICT
            }
            ApiError::Unprocessable { code, message } => {
                body.error = code.into();
                body.message = message;
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Validation { message, details } => {
                body.error = "VALIDATION_ERROR".into();
                body.message = message;
                body.details = (!details.is_empty()).then_some(details);
                StatusCode::BAD_REQUEST
            }
            ApiError::InvalidTokenFormat => {
                body.error = ReasonCode::InvalidHashFormat.as_str().into();
                body.message = ReasonCode::InvalidHashFormat.message().into();
                StatusCode::BAD_REQUEST
            }
            ApiError::RateLimited { retry_after_secs } => {
                body.error = ReasonCode::RateLimited.as_str().into();
                body.message = ReasonCode::RateLimited.message().into();
                body.retryable = true;
                body.retry_after = Some(retry_after_secs);
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                body.error = ReasonCode::InternalError.as_str().into();
                body.message = "An internal error occurred".into();
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::ServiceUnavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                body.error = ReasonCode::InternalError.as_str().into();
                body.message = ReasonCode::InternalError.message().into();
                body.retryable = true;
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        let retry_after = body.retry_after;
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<CodeError> for ApiError {
    fn from(err: CodeError) -> Self {
        let code = err.code();
        let message = err.to_string();
        match err {
            CodeError::RegistrationNotFound(_)
            | CodeError::ActiveCodeNotFound(_)
            | CodeError::CodeNotFound(_) => ApiError::NotFound { code, message },
            CodeError::CodeAlreadyExists(_) | CodeError::CodeNotActive { .. } => {
                ApiError::Conflict { code, message }
            }
            CodeError::RegistrationNotApproved(_) => ApiError::Unprocessable { code, message },
            CodeError::InvalidExpiry => ApiError::Validation {
                message,
                details: vec![ValidationDetail {
                    field: "expiresAt".into(),
                    message: "Expiry must be in the future".into(),
                }],
            },
            CodeError::TokenCollision | CodeError::Store(_) => ApiError::ServiceUnavailable(message),
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::InvalidHashFormat => ApiError::InvalidTokenFormat,
            ScanError::Store(e) => ApiError::ServiceUnavailable(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound {
                code: "NOT_FOUND",
                message: "Resource not found".into(),
            },
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("23505") => ApiError::Conflict {
                    code: "CONFLICT",
                    message: "Resource already exists".into(),
                },
                _ => ApiError::Internal(format!("Database error: {}", db_err)),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                ApiError::ServiceUnavailable(format!("Database unavailable: {}", err))
            }
            _ => ApiError::Internal(format!("Database error: {}", err)),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let details: Vec<ValidationDetail> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |e| ValidationDetail {
                    field: field.to_string(),
                    message: e
                        .message
                        .clone()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string()),
                })
            })
            .collect();

        let message = if details.len() == 1 {
            details[0].message.clone()
        } else {
            format!("{} validation errors", details.len())
        };

        ApiError::Validation { message, details }
    }
}
