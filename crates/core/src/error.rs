//! Error types for T-Minus core domain logic

use thiserror::Error;

/// Errors surfaced by the User Graph Coordinator and its callers.
///
/// The variants map one-to-one onto the wire error codes: everything a
/// caller can observe is one of these, and anything that is not a
/// validation, lookup, or state-machine problem is journaled and surfaced
/// as an opaque internal error.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("group commit failed: {0}")]
    CommitFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GraphError {
    /// Stable wire code for the uniform response envelope
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::NotFound(_) => "NOT_FOUND",
            GraphError::InvalidTransition { .. } => "INVALID_TRANSITION",
            GraphError::Validation(_) => "VALIDATION_ERROR",
            GraphError::CommitFailed(_) => "COMMIT_FAILED",
            GraphError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<sqlx::Error> for GraphError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => GraphError::NotFound("row not found".to_string()),
            other => GraphError::Internal(format!("store error: {other}")),
        }
    }
}

/// Result type alias for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(GraphError::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(
            GraphError::InvalidTransition {
                from: "committed".into(),
                to: "cancelled".into()
            }
            .code(),
            "INVALID_TRANSITION"
        );
        assert_eq!(GraphError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(GraphError::CommitFailed("x".into()).code(), "COMMIT_FAILED");
        assert_eq!(GraphError::Internal("x".into()).code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_sqlx_not_found_maps_to_not_found() {
        let err: GraphError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
