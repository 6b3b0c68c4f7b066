//! Constants for the price engine
//!
//! Compile-time defaults. Every value here can be overridden at runtime
//! through [`EngineConfig`](crate::config::EngineConfig).

/// How often to poll the active provider after a successful cycle (in seconds)
pub const REFRESH_INTERVAL_SECS: u64 = 10;

/// How long to wait before retrying after a failed listings poll (in seconds)
pub const BACKOFF_INTERVAL_SECS: u64 = 60;

/// Consecutive listings failures that trigger a switch to the next provider
pub const FAILOVER_THRESHOLD: u32 = 3;

/// How long before the listings snapshot is considered stale (in seconds)
pub const STALE_THRESHOLD_SECS: u64 = 300;

/// HTTP request timeout when talking to a provider (in seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Number of tokens requested from the provider per listings poll
pub const LISTINGS_LIMIT: u32 = 10;

/// Number of listings shown per page by the presentation layer
pub const PAGE_SIZE: usize = 3;

/// Rolling window requested from history endpoints (in days)
pub const HISTORY_WINDOW_DAYS: u32 = 7;

/// Maximum concurrent history requests within one poll cycle
pub const HISTORY_CONCURRENCY: usize = 4;

/// Quote currency
pub const DEFAULT_CURRENCY: &str = "USD";

/// CoinGecko API base URL
pub const COINGECKO_API_URL: &str = "https://api.coingecko.com/api/v3";

/// CryptoCompare API base URL
pub const CRYPTOCOMPARE_API_URL: &str = "https://min-api.cryptocompare.com/data";

/// CoinMarketCap API base URL
pub const COINMARKETCAP_API_URL: &str = "https://pro-api.coinmarketcap.com";

/// User agent for HTTP requests
pub const USER_AGENT: &str = "crypto-price-engine/0.1.0";
