//! Authenticated caller identity.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::ApiError;
use shared::crypto::{constant_time_eq, sha256_hex};

/// Header naming the operator behind a lifecycle change.
pub const ACTOR_HEADER: &str = "x-actor";

const KEY_ID_LEN: usize = 12;
const MAX_ACTOR_LEN: usize = 100;

/// Identity of a caller that passed API key authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyAuth {
    /// Leading characters of the key's SHA-256 hash; safe to log.
    pub key_id: String,
    /// Operator named by `X-Actor`, if any.
    pub operator: Option<String>,
}

impl ApiKeyAuth {
    /// Matches the presented key against the configured hashes.
    pub fn authenticate(presented: &str, accepted_hashes: &[String]) -> Option<Self> {
        let presented = presented.trim();
        if presented.is_empty() {
            return None;
        }
        let hash = sha256_hex(presented);
        // Every configured hash is compared so timing does not reveal which matched
        let matched = accepted_hashes
            .iter()
            .fold(false, |found, accepted| constant_time_eq(&hash, accepted) | found);

        matched.then(|| ApiKeyAuth {
            key_id: hash[..KEY_ID_LEN].to_string(),
            operator: None,
        })
    }

    /// Name recorded as `invalidatedBy` on lifecycle changes.
    pub fn actor(&self) -> String {
        match &self.operator {
            Some(operator) => format!("{} (key {})", operator, self.key_id),
            None => format!("key {}", self.key_id),
        }
    }
}

fn parse_operator(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.len() <= MAX_ACTOR_LEN)
        .map(str::to_string)
}

#[async_trait]
impl<S> FromRequestParts<S> for ApiKeyAuth
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let mut auth = parts
            .extensions
            .get::<ApiKeyAuth>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("Invalid or missing API key".into()))?;
        auth.operator = parse_operator(parts);
        Ok(auth)
    }
}
