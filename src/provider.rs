//! Provider abstraction for fetching listings and price history from external APIs

use crate::{
    error::ProviderError,
    types::{HistoricalSeries, Listing, ProviderCapabilities, TokenId},
};
use async_trait::async_trait;

/// Trait for market data providers
///
/// An implementation owns everything provider-specific: URLs, auth headers,
/// pagination scheme and response shape. The engine only ever sees canonical
/// [`Listing`] and [`HistoricalSeries`] values.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Returns the name of this provider
    fn provider_name(&self) -> &str;

    /// Describes which calls this provider can serve
    fn capabilities(&self) -> ProviderCapabilities;

    /// Fetches one page of current listings
    ///
    /// # Arguments
    /// * `page` - Page number, starting at 1
    /// * `page_size` - Number of tokens per page
    /// * `currency` - Quote currency, e.g. "USD"
    async fn fetch_listings(
        &self,
        page: u32,
        page_size: u32,
        currency: &str,
    ) -> Result<Vec<Listing>, ProviderError>;

    /// Fetches daily closing prices for one token
    ///
    /// # Arguments
    /// * `token_id` - Identifier as returned by this provider's listings
    /// * `window_days` - Number of days to look back
    /// * `currency` - Quote currency
    async fn fetch_history(
        &self,
        _token_id: &TokenId,
        _window_days: u32,
        _currency: &str,
    ) -> Result<HistoricalSeries, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.provider_name().to_string(),
            capability: "history",
        })
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::types::{HistoricalPoint, Price};
    use chrono::{TimeZone, Utc};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Builds a listing as `provider` would report it
    pub fn listing(provider: &str, id: &str, price: f64) -> Listing {
        Listing {
            token_id: TokenId::from(id),
            name: format!("Token {}", id),
            symbol: id.to_uppercase(),
            price: Price::new(price, "USD"),
            change_24h_pct: Some(1.5),
            source: provider.to_string(),
        }
    }

    /// Builds `count` listings with ids `t0..t{count-1}`
    pub fn listings(provider: &str, count: usize) -> Vec<Listing> {
        (0..count)
            .map(|i| listing(provider, &format!("t{}", i), 100.0 + i as f64))
            .collect()
    }

    /// Builds a series with one point per close, one day apart
    pub fn series(id: &str, closes: &[f64]) -> HistoricalSeries {
        let points = closes
            .iter()
            .enumerate()
            .map(|(i, close)| HistoricalPoint {
                token_id: TokenId::from(id),
                timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 86_400, 0).unwrap(),
                close: *close,
            })
            .collect();
        HistoricalSeries::new(TokenId::from(id), points)
    }

    /// Mock provider for testing
    ///
    /// Listings responses are taken from a scripted queue first and fall back
    /// to a default response once the queue is empty.
    pub struct MockProvider {
        name: String,
        capabilities: ProviderCapabilities,
        scripted: Mutex<VecDeque<Result<Vec<Listing>, ProviderError>>>,
        default_listings: Mutex<Result<Vec<Listing>, ProviderError>>,
        history: Mutex<HashMap<TokenId, Result<HistoricalSeries, ProviderError>>>,
        listings_delay: Mutex<Duration>,
        history_delay: Mutex<Duration>,
        listings_calls: Mutex<Vec<Instant>>,
        history_calls: Mutex<Vec<TokenId>>,
    }

    impl MockProvider {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                capabilities: ProviderCapabilities::FULL,
                scripted: Mutex::new(VecDeque::new()),
                default_listings: Mutex::new(Ok(listings(name, 10))),
                history: Mutex::new(HashMap::new()),
                listings_delay: Mutex::new(Duration::ZERO),
                history_delay: Mutex::new(Duration::ZERO),
                listings_calls: Mutex::new(Vec::new()),
                history_calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
            self.capabilities = capabilities;
            self
        }

        pub fn set_listings(&self, listings: Vec<Listing>) {
            *self.default_listings.lock().unwrap() = Ok(listings);
        }

        pub fn set_listings_error(&self, error: ProviderError) {
            *self.default_listings.lock().unwrap() = Err(error);
        }

        /// Queues a one-off listings response
        pub fn push_listings(&self, response: Result<Vec<Listing>, ProviderError>) {
            self.scripted.lock().unwrap().push_back(response);
        }

        pub fn set_history(&self, series: HistoricalSeries) {
            self.history
                .lock()
                .unwrap()
                .insert(series.token_id().clone(), Ok(series));
        }

        pub fn set_history_error(&self, token_id: &str, error: ProviderError) {
            self.history
                .lock()
                .unwrap()
                .insert(TokenId::from(token_id), Err(error));
        }

        pub fn set_listings_delay(&self, delay: Duration) {
            *self.listings_delay.lock().unwrap() = delay;
        }

        pub fn set_history_delay(&self, delay: Duration) {
            *self.history_delay.lock().unwrap() = delay;
        }

        pub fn listings_call_count(&self) -> usize {
            self.listings_calls.lock().unwrap().len()
        }

        /// Instants at which `fetch_listings` was entered
        pub fn listings_call_times(&self) -> Vec<Instant> {
            self.listings_calls.lock().unwrap().clone()
        }

        pub fn history_call_count(&self) -> usize {
            self.history_calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockProvider {
        fn provider_name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> ProviderCapabilities {
            self.capabilities
        }

        async fn fetch_listings(
            &self,
            page: u32,
            page_size: u32,
            _currency: &str,
        ) -> Result<Vec<Listing>, ProviderError> {
            self.listings_calls.lock().unwrap().push(Instant::now());

            let delay = *self.listings_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let scripted = self.scripted.lock().unwrap().pop_front();
            let response = match scripted {
                Some(response) => response,
                None => self.default_listings.lock().unwrap().clone(),
            };

            response.map(|all| {
                let start = (page.saturating_sub(1) * page_size) as usize;
                all.into_iter().skip(start).take(page_size as usize).collect()
            })
        }

        async fn fetch_history(
            &self,
            token_id: &TokenId,
            _window_days: u32,
            _currency: &str,
        ) -> Result<HistoricalSeries, ProviderError> {
            self.history_calls.lock().unwrap().push(token_id.clone());

            let delay = *self.history_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let configured = self.history.lock().unwrap().get(token_id).cloned();
            configured.unwrap_or_else(|| Ok(series(token_id.as_str(), &[1.0, 2.0])))
        }
    }
}
