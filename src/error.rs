//! Error types for the price engine

use crate::classifier::FailureClass;
use thiserror::Error;

/// Errors raised by a provider adapter while fetching listings or history
///
/// Every variant names the provider so a failure can be reported without
/// extra context. The HTTP status is kept whenever the upstream sent one.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProviderError {
    /// Provider refused the request because of its rate limit
    #[error("{provider}: rate limit exceeded: {message}")]
    RateLimited {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// Request did not complete within the configured timeout
    #[error("{provider}: request timeout")]
    Timeout { provider: String },

    /// Connection could not be established or was reset
    #[error("{provider}: network error: {message}")]
    Network { provider: String, message: String },

    /// Non-success HTTP status without a more specific meaning
    #[error("{provider}: HTTP {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },

    /// Response arrived but did not match the expected schema
    #[error("{provider}: malformed response: {message}")]
    Malformed { provider: String, message: String },

    /// Provider answered with an error payload that carries no status
    #[error("{provider}: provider rejected request: {message}")]
    Rejected { provider: String, message: String },

    /// Provider lacks the requested capability
    #[error("{provider}: {capability} not supported")]
    Unsupported {
        provider: String,
        capability: &'static str,
    },

    /// HTTP client could not be constructed
    #[error("{provider}: client setup failed: {message}")]
    Client { provider: String, message: String },
}

impl ProviderError {
    /// Maps a transport error from `reqwest` onto the provider taxonomy
    pub fn from_reqwest(provider: &str, err: reqwest::Error) -> Self {
        let provider = provider.to_string();
        if err.is_timeout() {
            Self::Timeout { provider }
        } else if err.is_decode() {
            Self::Malformed {
                provider,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            Self::Http {
                provider,
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_builder() {
            Self::Client {
                provider,
                message: err.to_string(),
            }
        } else {
            Self::Network {
                provider,
                message: err.to_string(),
            }
        }
    }

    /// Creates a Malformed error
    pub fn malformed(provider: &str, msg: impl Into<String>) -> Self {
        Self::Malformed {
            provider: provider.to_string(),
            message: msg.into(),
        }
    }

    /// Creates a RateLimited error
    pub fn rate_limited(provider: &str, status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::RateLimited {
            provider: provider.to_string(),
            status,
            message: msg.into(),
        }
    }

    /// Creates a Timeout error
    pub fn timeout(provider: &str) -> Self {
        Self::Timeout {
            provider: provider.to_string(),
        }
    }

    /// Name of the provider that produced the error
    pub fn provider(&self) -> &str {
        match self {
            Self::RateLimited { provider, .. }
            | Self::Timeout { provider }
            | Self::Network { provider, .. }
            | Self::Http { provider, .. }
            | Self::Malformed { provider, .. }
            | Self::Rejected { provider, .. }
            | Self::Unsupported { provider, .. }
            | Self::Client { provider, .. } => provider,
        }
    }

    /// HTTP status reported by the provider, when one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { status, .. } => *status,
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Typed outcome of an engine operation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Configuration could not be used to build an engine
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Engine has been stopped
    #[error("Engine is not running")]
    NotRunning,

    /// Every configured provider failed with a fatal error
    #[error("All providers failed with fatal errors")]
    AllProvidersFatal,

    /// Pages are numbered from 1
    #[error("Invalid page: {0}")]
    InvalidPage(usize),

    /// Listings poll failed
    #[error("Poll against {provider} failed ({class}): {message}")]
    Poll {
        provider: String,
        class: FailureClass,
        message: String,
    },

    /// Result belonged to a poll cycle that was superseded
    #[error("Result of cycle {cycle} discarded, current cycle is {current}")]
    StaleResult { cycle: u64, current: u64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Creates a Config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an Internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wraps a listings failure together with its classification
    pub fn poll(err: &ProviderError, class: FailureClass) -> Self {
        Self::Poll {
            provider: err.provider().to_string(),
            class,
            message: err.to_string(),
        }
    }
}

/// Error type returned by event listeners
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;
