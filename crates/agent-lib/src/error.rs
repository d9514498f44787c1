//! Error types shared across the agent library

use thiserror::Error;

/// Failures surfaced by the metadata store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The alias is not bound to any resource.
    #[error("no resource bound to alias {0:?}")]
    NotFound(String),
}

/// Failures surfaced by a poll source.
///
/// Transient failures are logged and retried; the updater only reports
/// itself unhealthy after they persist for several consecutive periods.
/// Permanent failures stop the retry loop immediately.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("transient query failure: {0}")]
    Transient(#[source] anyhow::Error),
    #[error("permanent query failure: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl QueryError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound("nope".to_string());
        assert_eq!(err.to_string(), "no resource bound to alias \"nope\"");
    }

    #[test]
    fn test_query_error_kinds() {
        let transient = QueryError::transient(anyhow::anyhow!("connection reset"));
        let permanent = QueryError::permanent(anyhow::anyhow!("401 Unauthorized"));

        assert!(matches!(transient, QueryError::Transient(_)));
        assert!(matches!(permanent, QueryError::Permanent(_)));
    }
}
