//! Runtime configuration for the engine
//!
//! Defaults come from [`constants`](crate::constants). `EngineConfig` can be
//! deserialized from JSON or built from environment variables.

use crate::{
    constants::{
        BACKOFF_INTERVAL_SECS, DEFAULT_CURRENCY, FAILOVER_THRESHOLD, HISTORY_WINDOW_DAYS,
        LISTINGS_LIMIT, PAGE_SIZE, REFRESH_INTERVAL_SECS, REQUEST_TIMEOUT_SECS,
    },
    error::EngineError,
    scheduler::SchedulerConfig,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Built-in HTTP providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    CoinGecko,
    CryptoCompare,
    CoinMarketCap,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::CoinGecko => "coingecko",
            ProviderKind::CryptoCompare => "cryptocompare",
            ProviderKind::CoinMarketCap => "coinmarketcap",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coingecko" => Ok(ProviderKind::CoinGecko),
            "cryptocompare" => Ok(ProviderKind::CryptoCompare),
            "coinmarketcap" | "cmc" => Ok(ProviderKind::CoinMarketCap),
            other => Err(EngineError::config(format!("unknown provider '{}'", other))),
        }
    }
}

/// How the first active provider is chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialProvider {
    /// First provider in the configured order
    First,
    /// Provider with this name
    Named(String),
    /// Uniformly random; seeded for reproducible runs
    Random { seed: Option<u64> },
}

impl InitialProvider {
    /// Index into `names` of the provider to start with
    pub fn select(&self, names: &[&str]) -> Result<usize, EngineError> {
        if names.is_empty() {
            return Err(EngineError::config("no providers configured"));
        }

        match self {
            InitialProvider::First => Ok(0),
            InitialProvider::Named(wanted) => names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(wanted))
                .ok_or_else(|| {
                    EngineError::config(format!("initial provider '{}' is not configured", wanted))
                }),
            InitialProvider::Random { seed } => {
                let mut rng = match seed {
                    Some(seed) => StdRng::seed_from_u64(*seed),
                    None => StdRng::from_entropy(),
                };
                Ok(rng.gen_range(0..names.len()))
            }
        }
    }
}

/// API keys for the built-in providers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub coingecko: Option<String>,
    pub cryptocompare: Option<String>,
    pub coinmarketcap: Option<String>,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Providers in round-robin order
    pub providers: Vec<ProviderKind>,

    pub initial_provider: InitialProvider,

    /// Seconds between polls after a success
    pub refresh_interval_secs: u64,

    /// Seconds before the retry after a failure
    pub backoff_interval_secs: u64,

    /// Consecutive listings failures before switching provider
    pub failover_threshold: u32,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Tokens requested per listings poll
    pub listings_limit: u32,

    /// Listings per presentation page
    pub page_size: usize,

    /// Days of history requested per token
    pub history_window_days: u32,

    /// Fetch history for each listed token after a successful poll
    pub fetch_history: bool,

    pub currency: String,

    pub api_keys: ApiKeys,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderKind::CoinGecko,
                ProviderKind::CryptoCompare,
                ProviderKind::CoinMarketCap,
            ],
            initial_provider: InitialProvider::First,
            refresh_interval_secs: REFRESH_INTERVAL_SECS,
            backoff_interval_secs: BACKOFF_INTERVAL_SECS,
            failover_threshold: FAILOVER_THRESHOLD,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            listings_limit: LISTINGS_LIMIT,
            page_size: PAGE_SIZE,
            history_window_days: HISTORY_WINDOW_DAYS,
            fetch_history: true,
            currency: DEFAULT_CURRENCY.to_string(),
            api_keys: ApiKeys::default(),
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from the environment, falling back to defaults
    ///
    /// * `PRICE_ENGINE_PROVIDERS` - comma-separated provider order
    /// * `PRICE_ENGINE_INITIAL_PROVIDER` - `first`, `random` or a provider name
    /// * `PRICE_ENGINE_SEED` - seed for `random`
    /// * `PRICE_ENGINE_CURRENCY` - quote currency
    /// * `COINGECKO_API_KEY`, `CRYPTOCOMPARE_API_KEY`, `COINMARKETCAP_API_KEY`
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();

        if let Some(list) = lookup("PRICE_ENGINE_PROVIDERS") {
            config.providers = list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(ProviderKind::from_str)
                .collect::<Result<_, _>>()?;
            if config.providers.is_empty() {
                return Err(EngineError::config("PRICE_ENGINE_PROVIDERS is empty"));
            }
        }

        let seed = lookup("PRICE_ENGINE_SEED")
            .map(|s| {
                s.parse::<u64>()
                    .map_err(|_| EngineError::config(format!("invalid seed '{}'", s)))
            })
            .transpose()?;

        if let Some(initial) = lookup("PRICE_ENGINE_INITIAL_PROVIDER") {
            config.initial_provider = match initial.to_lowercase().as_str() {
                "first" => InitialProvider::First,
                "random" => InitialProvider::Random { seed },
                name => InitialProvider::Named(name.to_string()),
            };
        }

        if let Some(currency) = lookup("PRICE_ENGINE_CURRENCY") {
            config.currency = currency.to_uppercase();
        }

        config.api_keys = ApiKeys {
            coingecko: lookup("COINGECKO_API_KEY"),
            cryptocompare: lookup("CRYPTOCOMPARE_API_KEY"),
            coinmarketcap: lookup("COINMARKETCAP_API_KEY"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with
    ///
    /// The provider list is not checked here; engines built from injected
    /// adapters ignore it.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.failover_threshold == 0 {
            return Err(EngineError::config("failover threshold must be at least 1"));
        }
        if self.page_size == 0 || self.listings_limit == 0 {
            return Err(EngineError::config("page sizes must be at least 1"));
        }
        if self.refresh_interval_secs == 0 || self.backoff_interval_secs == 0 {
            return Err(EngineError::config("intervals must be at least 1 second"));
        }
        if self.request_timeout_secs == 0 {
            return Err(EngineError::config("request timeout must be at least 1 second"));
        }
        if self.currency.trim().is_empty() {
            return Err(EngineError::config("currency must not be empty"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            normal_interval: Duration::from_secs(self.refresh_interval_secs),
            backoff_interval: Duration::from_secs(self.backoff_interval_secs),
            failover_threshold: self.failover_threshold,
        }
    }
}
