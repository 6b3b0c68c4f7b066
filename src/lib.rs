//! # Crypto Price Engine
//!
//! Polls public market-data providers (CoinGecko, CryptoCompare,
//! CoinMarketCap) for the top cryptocurrency listings and their recent daily
//! price history, and keeps the latest results in an in-memory cache.
//!
//! Failed polls are classified (rate limit, transient, malformed, fatal) and
//! retried after a backoff. Repeated failures switch to the next provider in
//! round-robin order.
//!
//! ## Usage
//!
//! The engine is an explicit handle; create one and keep it for as long as
//! polling should run:
//!
//! ```no_run
//! use crypto_price_engine::{EngineConfig, PriceEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = PriceEngine::start(EngineConfig::from_env()?).await?;
//!
//! engine.subscribe(|event| {
//!     println!("{}", event);
//!     Ok(())
//! });
//!
//! // Force a poll instead of waiting for the timer
//! engine.refresh_now().await?;
//!
//! for listing in engine.set_page(1).await? {
//!     let history = engine.history(&listing.token_id).await;
//!     println!("{} {:.2} ({} days)", listing.symbol, listing.price.amount, history.len());
//! }
//!
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod listeners;
pub mod metrics;
pub mod provider;
pub mod providers;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use classifier::{classify, FailureClass};
pub use config::{ApiKeys, EngineConfig, InitialProvider, ProviderKind};
pub use engine::{PollReport, PriceEngine};
pub use error::{EngineError, ListenerError, ProviderError};
pub use listeners::ListenerId;
pub use metrics::ProviderMetrics;
pub use provider::MarketDataProvider;
pub use scheduler::SchedulerState;
pub use types::{
    ComponentHealth, EngineEvent, EngineStatus, HealthStatus, HistoricalPoint, HistoricalSeries,
    Listing, PollError, PollState, Price, ProviderCapabilities, TokenId,
};
