//! Retryability classification.

use std::fmt;
use std::sync::Arc;

use crate::error::RecoveryError;

/// Error signatures of transient failures, matched case-insensitively.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "enotfound",
    "dns",
    "network",
    "502",
    "503",
    "504",
    "bad gateway",
    "gateway timeout",
    "service unavailable",
    "temporarily unavailable",
];

/// Caller-supplied retryability decision, replacing [`is_transient`].
#[derive(Clone)]
pub struct RetryPredicate(Arc<dyn Fn(&RecoveryError) -> bool + Send + Sync>);

impl RetryPredicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&RecoveryError) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn is_retryable(&self, error: &RecoveryError) -> bool {
        (self.0)(error)
    }
}

impl fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

/// Built-in classification: attempt timeouts and errors whose message
/// matches a known transient signature are retryable. Admission rejections
/// never are.
pub fn is_transient(error: &RecoveryError) -> bool {
    if error.is_admission() {
        return false;
    }
    if matches!(error, RecoveryError::Timeout { .. }) {
        return true;
    }
    let message = error.to_string().to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
}
