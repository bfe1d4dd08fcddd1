//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

use crate::models::CodeStatus;

/// Failures reported by storage ports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The token hash unique constraint rejected the write.
    #[error("token hash already exists")]
    DuplicateToken,

    /// The one-active-code-per-registration constraint rejected the write.
    #[error("registration already has an active code")]
    ActiveCodeExists,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from issuance, regeneration, and invalidation.
#[derive(Debug, Error)]
pub enum CodeError {
    #[error("Registration {0} not found")]
    RegistrationNotFound(i64),

    #[error("Registration {0} is not approved")]
    RegistrationNotApproved(i64),

    #[error("Registration {0} already has an active code")]
    CodeAlreadyExists(i64),

    #[error("Expiry must be in the future")]
    InvalidExpiry,

    #[error("Registration {0} has no active code")]
    ActiveCodeNotFound(i64),

    #[error("Code {0} not found")]
    CodeNotFound(Uuid),

    #[error("Code {code_id} is {status}, not active")]
    CodeNotActive { code_id: Uuid, status: CodeStatus },

    #[error("Could not generate a unique token")]
    TokenCollision,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CodeError {
    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            CodeError::RegistrationNotFound(_) => "REGISTRATION_NOT_FOUND",
            CodeError::RegistrationNotApproved(_) => "REGISTRATION_NOT_APPROVED",
            CodeError::CodeAlreadyExists(_) => "CODE_ALREADY_EXISTS",
            CodeError::InvalidExpiry => "INVALID_EXPIRY",
            CodeError::ActiveCodeNotFound(_) => "ACTIVE_CODE_NOT_FOUND",
            CodeError::CodeNotFound(_) => "CODE_NOT_FOUND",
            CodeError::CodeNotActive { .. } => "CODE_NOT_ACTIVE",
            CodeError::TokenCollision => "TOKEN_COLLISION",
            CodeError::Store(_) => "INTERNAL_ERROR",
        }
    }
}

/// Errors from the scan path that prevent a decision.
///
/// Denials are not errors; they are carried in the scan outcome.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Presented token is not a 64 character hex digest")]
    InvalidHashFormat,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the external integrity anchor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnchorError {
    #[error("anchor request timed out")]
    Timeout,

    #[error("anchor service unavailable: {0}")]
    Unavailable(String),

    #[error("anchor service rejected the request: {0}")]
    Rejected(String),

    #[error("anchor circuit breaker is open")]
    CircuitOpen,

    #[error("anchoring is disabled")]
    Disabled,
}

impl AnchorError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnchorError::Timeout | AnchorError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_error_codes() {
        assert_eq!(CodeError::CodeAlreadyExists(1).code(), "CODE_ALREADY_EXISTS");
        assert_eq!(
            CodeError::CodeNotActive {
                code_id: Uuid::nil(),
                status: CodeStatus::Used
            }
            .code(),
            "CODE_NOT_ACTIVE"
        );
        assert_eq!(
            CodeError::from(StoreError::Unavailable("down".into())).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn test_code_not_active_message() {
        let err = CodeError::CodeNotActive {
            code_id: Uuid::nil(),
            status: CodeStatus::Invalidated,
        };
        assert!(err.to_string().contains("invalidated"));
    }

    #[test]
    fn test_anchor_error_retryable() {
        assert!(AnchorError::Timeout.is_retryable());
        assert!(AnchorError::Unavailable("503".into()).is_retryable());
        assert!(!AnchorError::Rejected("400".into()).is_retryable());
        assert!(!AnchorError::CircuitOpen.is_retryable());
        assert!(!AnchorError::Disabled.is_retryable());
    }
}
