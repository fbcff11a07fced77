//! Error taxonomy for the defense services

use crate::store::StoreError;
use std::time::Duration;
use warden_common::{RiskLevel, SessionState};

/// Errors produced by the defense services.
///
/// Store failures are never handed to HTTP callers as-is: each service maps
/// them onto its own fallback, and the pipeline turns whatever is left into a
/// generic 503.
#[derive(Debug, thiserror::Error)]
pub enum DefenseError {
    #[error("State store unavailable")]
    StoreUnavailable(String),

    #[error("State store timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Device fingerprint rejected: {0}")]
    InvalidFingerprint(String),

    #[error("Session integrity check failed")]
    IntegrityViolation,

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    CapacityExceeded { retry_after: Duration },

    #[error("Risk level {0} exceeds the allowed threshold")]
    RiskThresholdExceeded(RiskLevel),

    #[error("Account locked until {until}")]
    AccountLocked { until: chrono::DateTime<chrono::Utc> },

    #[error("Session is no longer valid ({0})")]
    SessionExpired(SessionState),

    #[error("Invalid configuration: {0}")]
    Misconfigured(String),
}

impl DefenseError {
    /// Whether this error came from the state store rather than the caller
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            DefenseError::StoreUnavailable(_) | DefenseError::StoreTimeout(_)
        )
    }
}

impl From<StoreError> for DefenseError {
    fn from(err: StoreError) -> Self {
        tracing::error!(severity = "critical", "State store failure: {}", err);
        match err {
            StoreError::Timeout(after) => DefenseError::StoreTimeout(after),
            other => DefenseError::StoreUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let timeout: DefenseError = StoreError::Timeout(Duration::from_millis(150)).into();
        assert!(matches!(timeout, DefenseError::StoreTimeout(_)));
        assert!(timeout.is_store_failure());

        let down: DefenseError = StoreError::Unavailable("connection refused".into()).into();
        assert!(down.is_store_failure());
        // The raw cause stays out of the display string
        assert_eq!(down.to_string(), "State store unavailable");

        assert!(!DefenseError::IntegrityViolation.is_store_failure());
    }
}
