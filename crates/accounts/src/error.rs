//! Account coordinator error taxonomy

use thiserror::Error;
use tminus_provider::ProviderError;

#[derive(Error, Debug)]
pub enum AccountError {
    /// Account was never initialized with a refresh token
    #[error("no credentials stored for this account")]
    NoCredentials,

    /// Provider rejected the refresh grant; terminal for this attempt
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Transient provider failure (5xx, network, rate limit, timeout)
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Capability the provider variant does not offer (e.g. webhooks on an
    /// ICS feed)
    #[error("unsupported for this provider: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AccountError {
    pub fn code(&self) -> &'static str {
        match self {
            AccountError::NoCredentials => "NO_CREDENTIALS",
            AccountError::RefreshFailed(_) => "REFRESH_FAILED",
            AccountError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            AccountError::NotFound(_) => "NOT_FOUND",
            AccountError::Unsupported(_) => "UNSUPPORTED",
            AccountError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AccountError::ProviderUnavailable(_))
    }

    /// Map a provider failure seen during a token refresh
    pub fn from_refresh(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(msg) | ProviderError::Terminal(msg) => {
                AccountError::RefreshFailed(msg)
            }
            other => AccountError::ProviderUnavailable(other.to_string()),
        }
    }

    /// Map a provider failure from any other account-scoped call
    pub fn from_provider(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(msg) => AccountError::RefreshFailed(msg),
            ProviderError::Terminal(msg) => AccountError::Unsupported(msg),
            other => AccountError::ProviderUnavailable(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for AccountError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AccountError::NotFound("row not found".into()),
            other => AccountError::Internal(format!("store error: {other}")),
        }
    }
}

pub type AccountResult<T> = Result<T, AccountError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_failure_mapping() {
        let auth = AccountError::from_refresh(ProviderError::Auth("bad grant".into()));
        assert_eq!(auth.code(), "REFRESH_FAILED");

        let flaky = AccountError::from_refresh(ProviderError::Transient("502".into()));
        assert_eq!(flaky.code(), "PROVIDER_UNAVAILABLE");
        assert!(flaky.is_transient());

        let limited = AccountError::from_refresh(ProviderError::RateLimited);
        assert!(limited.is_transient());
    }
}
