//! Common validation utilities for request fields.

use validator::ValidationError;

/// Maximum length of an access point identifier.
pub const MAX_ACCESS_POINT_LENGTH: usize = 100;

/// Maximum length of a free-text reason (invalidation, regeneration).
pub const MAX_REASON_LENGTH: usize = 500;

/// Maximum number of top-level keys in a code metadata bag.
pub const MAX_METADATA_KEYS: usize = 32;

/// Validates an access point identifier (gate, door, scanner id).
///
/// Allowed characters: ASCII alphanumerics, `-`, `_`, `.`, `:`.
pub fn validate_access_point(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || value.len() > MAX_ACCESS_POINT_LENGTH {
        let mut err = ValidationError::new("access_point_length");
        err.message = Some("Access point must be between 1 and 100 characters".into());
        return Err(err);
    }

    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !valid_chars {
        let mut err = ValidationError::new("access_point_chars");
        err.message = Some("Access point contains invalid characters".into());
        return Err(err);
    }

    Ok(())
}

/// Validates a human-supplied reason string.
pub fn validate_reason(value: &str) -> Result<(), ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        let mut err = ValidationError::new("reason_empty");
        err.message = Some("Reason must not be empty".into());
        return Err(err);
    }
    if value.chars().count() > MAX_REASON_LENGTH {
        let mut err = ValidationError::new("reason_length");
        err.message = Some("Reason cannot exceed 500 characters".into());
        return Err(err);
    }
    Ok(())
}

/// Validates that code metadata is a JSON object of bounded size.
pub fn validate_metadata(value: &serde_json::Value) -> Result<(), ValidationError> {
    match value.as_object() {
        Some(map) if map.len() <= MAX_METADATA_KEYS => Ok(()),
        Some(_) => {
            let mut err = ValidationError::new("metadata_size");
            err.message = Some("Metadata cannot have more than 32 keys".into());
            Err(err)
        }
        None => {
            let mut err = ValidationError::new("metadata_type");
            err.message = Some("Metadata must be a JSON object".into());
            Err(err)
        }
    }
}
