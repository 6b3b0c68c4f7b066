//! Classification of provider failures
//!
//! The scheduler never looks at a [`ProviderError`] directly. It asks
//! [`classify`] which of four classes the failure belongs to and acts on that.

use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a failed listings poll should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Provider throttled us (HTTP 429 or a rate-limit payload)
    RateLimited,
    /// Timeout, connection reset or a server-side hiccup
    Transient,
    /// Response arrived but could not be understood
    Malformed,
    /// Retrying this provider cannot succeed (bad credentials, unsupported call)
    Fatal,
}

impl FailureClass {
    /// Short snake_case label, used in logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Transient => "transient",
            FailureClass::Malformed => "malformed",
            FailureClass::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a provider failure. Total over [`ProviderError`]: anything not
/// recognised falls back to [`FailureClass::Transient`].
pub fn classify(failure: &ProviderError) -> FailureClass {
    match failure {
        ProviderError::RateLimited { .. } => FailureClass::RateLimited,
        ProviderError::Timeout { .. } | ProviderError::Network { .. } => FailureClass::Transient,
        ProviderError::Malformed { .. } => FailureClass::Malformed,
        ProviderError::Unsupported { .. } | ProviderError::Client { .. } => FailureClass::Fatal,
        ProviderError::Http { status, .. } => classify_status(*status),
        ProviderError::Rejected { .. } => FailureClass::Transient,
    }
}

/// Classifies a bare HTTP status
pub fn classify_status(status: u16) -> FailureClass {
    match status {
        429 => FailureClass::RateLimited,
        408 => FailureClass::Transient,
        400..=499 => FailureClass::Fatal,
        500..=599 => FailureClass::Transient,
        _ => FailureClass::Transient,
    }
}
