//! CoinGecko provider implementation
//!
//! Listings come from `/coins/markets`, paged by page number. History comes
//! from `/coins/{id}/market_chart` with daily granularity.

use crate::{
    constants::COINGECKO_API_URL,
    error::ProviderError,
    provider::MarketDataProvider,
    providers::http,
    types::{HistoricalPoint, HistoricalSeries, Listing, Price, ProviderCapabilities, TokenId},
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const NAME: &str = "coingecko";

/// One entry of the `/coins/markets` response
#[derive(Debug, Deserialize)]
struct MarketEntry {
    id: String,
    symbol: String,
    name: String,
    #[serde(default)]
    current_price: Option<f64>,
    #[serde(default)]
    price_change_percentage_24h: Option<f64>,
}

/// `/coins/{id}/market_chart` response; each price is `[millis, price]`
#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(f64, f64)>,
}

/// CoinGecko provider
pub struct CoinGeckoProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CoinGeckoProvider {
    /// Creates a new CoinGecko provider
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(NAME, timeout)?,
            base_url: COINGECKO_API_URL.to_string(),
            api_key,
        })
    }

    /// Points the provider at another host, e.g. the pro API
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn listings_query(page: u32, page_size: u32, currency: &str) -> Vec<(&'static str, String)> {
        vec![
            ("vs_currency", currency.to_lowercase()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", page_size.to_string()),
            ("page", page.max(1).to_string()),
            ("price_change_percentage", "24h".to_string()),
        ]
    }

    fn history_query(window_days: u32, currency: &str) -> Vec<(&'static str, String)> {
        vec![
            ("vs_currency", currency.to_lowercase()),
            ("days", window_days.to_string()),
            ("interval", "daily".to_string()),
        ]
    }

    /// Error payloads look like `{"status": {"error_code": 429, ...}}` or
    /// `{"error": "..."}`
    fn check_error_payload(value: &serde_json::Value) -> Result<(), ProviderError> {
        if let Some(status) = value.get("status") {
            if let Some(code) = status.get("error_code").and_then(|c| c.as_u64()) {
                let message = status
                    .get("error_message")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string();
                if code == 429 {
                    return Err(ProviderError::rate_limited(NAME, Some(429), message));
                }
                return Err(match u16::try_from(code) {
                    Ok(status) if (100..600).contains(&status) => ProviderError::Http {
                        provider: NAME.to_string(),
                        status,
                        message,
                    },
                    _ => ProviderError::Rejected {
                        provider: NAME.to_string(),
                        message,
                    },
                });
            }
        }
        if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
            return Err(ProviderError::Rejected {
                provider: NAME.to_string(),
                message: message.to_string(),
            });
        }
        Ok(())
    }

    fn parse_listings(body: &str, currency: &str) -> Result<Vec<Listing>, ProviderError> {
        let value: serde_json::Value = http::parse_json(NAME, body)?;
        Self::check_error_payload(&value)?;
        let entries: Vec<MarketEntry> = http::from_value(NAME, value)?;
        let total = entries.len();

        let listings: Vec<Listing> = entries
            .into_iter()
            .filter_map(|entry| {
                let Some(price) = entry.current_price else {
                    tracing::debug!(token = %entry.id, "Skipping listing without a price");
                    return None;
                };
                Some(Listing {
                    token_id: TokenId::new(entry.id),
                    name: entry.name,
                    symbol: entry.symbol.to_uppercase(),
                    price: Price::new(price, currency.to_uppercase()),
                    change_24h_pct: entry.price_change_percentage_24h,
                    source: NAME.to_string(),
                })
            })
            .collect();

        if total > 0 && listings.is_empty() {
            return Err(ProviderError::malformed(NAME, "no listing carried a price"));
        }
        Ok(listings)
    }

    fn parse_history(token_id: &TokenId, body: &str) -> Result<HistoricalSeries, ProviderError> {
        let value: serde_json::Value = http::parse_json(NAME, body)?;
        Self::check_error_payload(&value)?;
        let chart: MarketChart = http::from_value(NAME, value)?;

        let points = chart
            .prices
            .into_iter()
            .map(|(millis, close)| {
                let timestamp = Utc
                    .timestamp_millis_opt(millis as i64)
                    .single()
                    .ok_or_else(|| {
                        ProviderError::malformed(NAME, format!("invalid timestamp {}", millis))
                    })?;
                Ok(HistoricalPoint {
                    token_id: token_id.clone(),
                    timestamp,
                    close,
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        Ok(HistoricalSeries::new(token_id.clone(), points))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("x-cg-demo-api-key", key),
            None => request,
        }
    }
}

#[async_trait]
impl MarketDataProvider for CoinGeckoProvider {
    fn provider_name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::FULL
    }

    async fn fetch_listings(
        &self,
        page: u32,
        page_size: u32,
        currency: &str,
    ) -> Result<Vec<Listing>, ProviderError> {
        let url = format!("{}/coins/markets", self.base_url);
        tracing::debug!(url = %url, page, page_size, "Fetching listings from CoinGecko");

        let request = self
            .authorize(self.client.get(&url))
            .query(&Self::listings_query(page, page_size, currency));
        let body = http::get_text(NAME, request).await?;
        let listings = Self::parse_listings(&body, currency)?;

        tracing::debug!(count = listings.len(), "Fetched listings from CoinGecko");
        Ok(listings)
    }

    async fn fetch_history(
        &self,
        token_id: &TokenId,
        window_days: u32,
        currency: &str,
    ) -> Result<HistoricalSeries, ProviderError> {
        let url = format!("{}/coins/{}/market_chart", self.base_url, token_id);
        tracing::debug!(url = %url, window_days, "Fetching history from CoinGecko");

        let request = self
            .authorize(self.client.get(&url))
            .query(&Self::history_query(window_days, currency));
        let body = http::get_text(NAME, request).await?;
        Self::parse_history(token_id, &body)
    }
}
