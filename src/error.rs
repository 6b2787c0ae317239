//! Error taxonomy shared across the RPC surface.
//!
//! Handlers return `anyhow::Result`; at the dispatch boundary the error is
//! downcast to [`A2aError`] and translated into the wire `{code, message}`
//! object. Anything that is not an `A2aError` surfaces as `INTERNAL_ERROR`
//! without leaking internals.

use thiserror::Error;

/// Wire error code strings. Must match the protocol clients.
pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
pub const NOT_FOUND: &str = "NOT_FOUND";
pub const CONFLICT: &str = "CONFLICT";
pub const RATE_LIMITED: &str = "RATE_LIMITED";
pub const VALIDATION_FAILED: &str = "VALIDATION_FAILED";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Typed failure raised by the core components.
#[derive(Debug, Error)]
pub enum A2aError {
    /// Missing, expired, or invalid session/token. The message never reveals
    /// whether the credential ever existed.
    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Illegal state transition; state is unchanged.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited — retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// Malformed input rejected by the sanitizer; names the first violated rule.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal error")]
    Internal,
}

impl A2aError {
    /// The wire code string for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            A2aError::Unauthorized => UNAUTHORIZED,
            A2aError::InvalidParams(_) => INVALID_PARAMS,
            A2aError::MethodNotFound(_) => METHOD_NOT_FOUND,
            A2aError::NotFound(_) => NOT_FOUND,
            A2aError::Conflict(_) => CONFLICT,
            A2aError::RateLimited { .. } => RATE_LIMITED,
            A2aError::Validation(_) => VALIDATION_FAILED,
            A2aError::Internal => INTERNAL_ERROR,
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            A2aError::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }
}
