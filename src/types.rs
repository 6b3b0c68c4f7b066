//! Types for the price engine

use crate::classifier::FailureClass;
use crate::scheduler::SchedulerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Provider-scoped token identifier
///
/// The same asset is "bitcoin" on CoinGecko, "BTC" on CryptoCompare and "1"
/// on CoinMarketCap. Identifiers are only comparable within one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TokenId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Currency-tagged price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
}

impl Price {
    pub fn new(amount: f64, currency: impl Into<String>) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }
}

/// Current snapshot of one token as reported by one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    /// Identifier within `source`
    pub token_id: TokenId,

    /// Display name, e.g. "Bitcoin"
    pub name: String,

    /// Ticker symbol, e.g. "BTC"
    pub symbol: String,

    /// Current price
    pub price: Price,

    /// 24h price change percentage, absent when the provider omits it
    pub change_24h_pct: Option<f64>,

    /// Provider that produced this listing
    pub source: String,
}

/// One closing price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub token_id: TokenId,
    pub timestamp: DateTime<Utc>,
    pub close: f64,
}

/// Closing prices for one token, ascending by timestamp, one point per timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSeries {
    token_id: TokenId,
    points: Vec<HistoricalPoint>,
}

impl HistoricalSeries {
    /// Builds a series from points in any order.
    ///
    /// Points are sorted by timestamp. When two points share a timestamp the
    /// one that came later in `points` is kept.
    pub fn new(token_id: TokenId, mut points: Vec<HistoricalPoint>) -> Self {
        points.sort_by_key(|p| p.timestamp);

        let mut deduped: Vec<HistoricalPoint> = Vec::with_capacity(points.len());
        for point in points {
            match deduped.last_mut() {
                Some(last) if last.timestamp == point.timestamp => *last = point,
                _ => deduped.push(point),
            }
        }

        Self {
            token_id,
            points: deduped,
        }
    }

    /// Empty series for a token that has never been fetched
    pub fn empty(token_id: TokenId) -> Self {
        Self {
            token_id,
            points: Vec::new(),
        }
    }

    pub fn token_id(&self) -> &TokenId {
        &self.token_id
    }

    pub fn points(&self) -> &[HistoricalPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Most recent closing price
    pub fn latest(&self) -> Option<&HistoricalPoint> {
        self.points.last()
    }
}

/// What a provider can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// Paged listings of current prices
    pub listings: bool,
    /// Per-token closing price history
    pub history: bool,
}

impl ProviderCapabilities {
    pub const FULL: Self = Self {
        listings: true,
        history: true,
    };
}

/// Overall engine status as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// No poll has completed yet
    Starting,
    /// Last listings poll succeeded
    Healthy,
    /// Listings polls are failing, retries are scheduled
    Retrying,
    /// A full provider rotation ended with every provider rate-limited.
    /// Recoverable; polling continues with backoff.
    AllProvidersRateLimited,
    /// Every provider failed with a fatal error. Polling has stopped.
    AllProvidersFatal,
    /// Engine was stopped
    Stopped,
}

impl EngineStatus {
    /// True when the engine will not poll again
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineStatus::AllProvidersFatal | EngineStatus::Stopped)
    }
}

/// Latest listings failure, replaced on every new failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollError {
    pub provider: String,
    pub class: FailureClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of the engine's poll state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollState {
    /// Provider the next poll will target
    pub active_provider: String,

    /// Consecutive listings failures against the active provider
    pub consecutive_failures: u32,

    /// When listings were last written to the cache
    pub last_update: Option<DateTime<Utc>>,

    /// Latest listings error, cleared by the next success
    pub last_error: Option<PollError>,

    /// Page currently shown by the presentation layer (1-based)
    pub page: usize,

    /// Current poll cycle id
    pub cycle: u64,

    /// Scheduler state machine position
    pub scheduler_state: SchedulerState,

    pub status: EngineStatus,
}

/// Events delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    /// A new listings snapshot was written
    ListingsUpdated {
        id: Uuid,
        cycle: u64,
        provider: String,
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A token's history series was replaced
    HistoryUpdated {
        id: Uuid,
        cycle: u64,
        provider: String,
        token_id: TokenId,
        points: usize,
        timestamp: DateTime<Utc>,
    },

    /// A listings poll failed
    PollFailed {
        id: Uuid,
        provider: String,
        class: FailureClass,
        error_message: String,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// The active provider changed
    ProviderSwitched {
        id: Uuid,
        from: String,
        to: String,
        reason: FailureClass,
        timestamp: DateTime<Utc>,
    },

    /// Engine status changed
    StatusChanged {
        id: Uuid,
        status: EngineStatus,
        timestamp: DateTime<Utc>,
    },

    /// Presentation page changed
    PageChanged {
        id: Uuid,
        page: usize,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub(crate) fn listings_updated(cycle: u64, provider: &str, count: usize) -> Self {
        Self::ListingsUpdated {
            id: Uuid::new_v4(),
            cycle,
            provider: provider.to_string(),
            count,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn history_updated(cycle: u64, provider: &str, series: &HistoricalSeries) -> Self {
        Self::HistoryUpdated {
            id: Uuid::new_v4(),
            cycle,
            provider: provider.to_string(),
            token_id: series.token_id().clone(),
            points: series.len(),
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn poll_failed(error: &PollError, consecutive_failures: u32) -> Self {
        Self::PollFailed {
            id: Uuid::new_v4(),
            provider: error.provider.clone(),
            class: error.class,
            error_message: error.message.clone(),
            consecutive_failures,
            timestamp: error.at,
        }
    }

    pub(crate) fn provider_switched(from: &str, to: &str, reason: FailureClass) -> Self {
        Self::ProviderSwitched {
            id: Uuid::new_v4(),
            from: from.to_string(),
            to: to.to_string(),
            reason,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn status_changed(status: EngineStatus) -> Self {
        Self::StatusChanged {
            id: Uuid::new_v4(),
            status,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn page_changed(page: usize) -> Self {
        Self::PageChanged {
            id: Uuid::new_v4(),
            page,
            timestamp: Utc::now(),
        }
    }

    /// Get the event ID
    pub fn id(&self) -> Uuid {
        match self {
            EngineEvent::ListingsUpdated { id, .. } => *id,
            EngineEvent::HistoryUpdated { id, .. } => *id,
            EngineEvent::PollFailed { id, .. } => *id,
            EngineEvent::ProviderSwitched { id, .. } => *id,
            EngineEvent::StatusChanged { id, .. } => *id,
            EngineEvent::PageChanged { id, .. } => *id,
        }
    }

    /// Get the event type as string
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::ListingsUpdated { .. } => "LISTINGS_UPDATED",
            EngineEvent::HistoryUpdated { .. } => "HISTORY_UPDATED",
            EngineEvent::PollFailed { .. } => "POLL_FAILED",
            EngineEvent::ProviderSwitched { .. } => "PROVIDER_SWITCHED",
            EngineEvent::StatusChanged { .. } => "STATUS_CHANGED",
            EngineEvent::PageChanged { .. } => "PAGE_CHANGED",
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::ListingsUpdated {
                provider, count, ..
            } => write!(f, "Listings updated: {} tokens from {}", count, provider),
            EngineEvent::HistoryUpdated {
                token_id, points, ..
            } => write!(f, "History updated: {} ({} points)", token_id, points),
            EngineEvent::PollFailed {
                provider,
                error_message,
                ..
            } => write!(f, "Poll against {} failed: {}", provider, error_message),
            EngineEvent::ProviderSwitched { from, to, reason, .. } => {
                write!(f, "Provider switched from {} to {} ({})", from, to, reason)
            }
            EngineEvent::StatusChanged { status, .. } => write!(f, "Engine status: {:?}", status),
            EngineEvent::PageChanged { page, .. } => write!(f, "Page changed to {}", page),
        }
    }
}

/// Overall system health status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// System is healthy and all components are operational
    Healthy,
    /// System is degraded but still functional
    Degraded,
    /// System is unhealthy and requires attention
    Unhealthy,
}

/// Component health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional status message
    pub message: Option<String>,
    /// Component-specific details
    pub details: std::collections::HashMap<String, serde_json::Value>,
    /// Last checked timestamp
    pub last_checked: DateTime<Utc>,
}
