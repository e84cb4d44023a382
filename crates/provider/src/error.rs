//! Provider error taxonomy
//!
//! Callers recover locally from auth (refresh once) and transient classes;
//! cursor invalidation falls back to a full list; everything terminal
//! surfaces and is left to drift reconciliation.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("sync cursor invalidated")]
    CursorInvalidated,

    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("terminal provider failure: {0}")]
    Terminal(String),
}

impl ProviderError {
    /// Retryable with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::RateLimited)
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ProviderError::Transient(err.to_string())
        } else {
            ProviderError::Terminal(err.to_string())
        }
    }
}

/// Map an HTTP status from a list/write call into the taxonomy.
/// `cursor_call` makes 410 mean "cursor invalidated" instead of "gone".
pub fn classify_status(status: reqwest::StatusCode, body: &str, cursor_call: bool) -> ProviderError {
    match status.as_u16() {
        401 => ProviderError::Auth(body.to_string()),
        410 if cursor_call => ProviderError::CursorInvalidated,
        429 => ProviderError::RateLimited,
        500..=599 => ProviderError::Transient(format!("{status}: {body}")),
        _ => ProviderError::Terminal(format!("{status}: {body}")),
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
