//! CryptoCompare provider implementation
//!
//! Listings come from `/top/mktcapfull` (zero-based `page`), history from
//! `/v2/histoday`. Token ids are CryptoCompare symbols such as "BTC".
//! Errors are often reported in-band with HTTP 200 and `"Response": "Error"`.

use crate::{
    constants::CRYPTOCOMPARE_API_URL,
    error::ProviderError,
    provider::MarketDataProvider,
    providers::http,
    types::{HistoricalPoint, HistoricalSeries, Listing, Price, ProviderCapabilities, TokenId},
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const NAME: &str = "cryptocompare";

#[derive(Debug, Deserialize)]
struct TopListResponse {
    #[serde(rename = "Data")]
    data: Vec<TopListEntry>,
}

#[derive(Debug, Deserialize)]
struct TopListEntry {
    #[serde(rename = "CoinInfo")]
    coin_info: CoinInfo,
    #[serde(rename = "RAW")]
    raw: Option<HashMap<String, RawQuote>>,
}

#[derive(Debug, Deserialize)]
struct CoinInfo {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "FullName")]
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct RawQuote {
    #[serde(rename = "PRICE")]
    price: f64,
    #[serde(rename = "CHANGEPCT24HOUR", default)]
    change_pct_24h: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct HistoDayResponse {
    #[serde(rename = "Data")]
    data: HistoDayData,
}

#[derive(Debug, Deserialize)]
struct HistoDayData {
    #[serde(rename = "Data")]
    data: Vec<HistoDayCandle>,
}

#[derive(Debug, Deserialize)]
struct HistoDayCandle {
    time: i64,
    close: f64,
}

/// CryptoCompare provider
pub struct CryptoCompareProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CryptoCompareProvider {
    /// Creates a new CryptoCompare provider
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(NAME, timeout)?,
            base_url: CRYPTOCOMPARE_API_URL.to_string(),
            api_key,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// CryptoCompare pages start at 0
    fn listings_query(page: u32, page_size: u32, currency: &str) -> Vec<(&'static str, String)> {
        vec![
            ("limit", page_size.to_string()),
            ("tsym", currency.to_uppercase()),
            ("page", page.saturating_sub(1).to_string()),
        ]
    }

    fn history_query(
        token_id: &TokenId,
        window_days: u32,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("fsym", token_id.as_str().to_string()),
            ("tsym", currency.to_uppercase()),
            ("limit", window_days.to_string()),
            ("toTs", now.timestamp().to_string()),
        ]
    }

    fn check_error_payload(value: &serde_json::Value) -> Result<(), ProviderError> {
        if value.get("Response").and_then(|r| r.as_str()) != Some("Error") {
            return Ok(());
        }

        let message = value
            .get("Message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string();
        let lowered = message.to_lowercase();

        let rate_limit_block = value
            .get("RateLimit")
            .and_then(|r| r.as_object())
            .is_some_and(|o| !o.is_empty());
        if lowered.contains("rate limit") || rate_limit_block {
            return Err(ProviderError::rate_limited(NAME, None, message));
        }
        // Credential problems are reported in-band; surface them as 401
        if lowered.contains("api key") {
            return Err(ProviderError::Http {
                provider: NAME.to_string(),
                status: 401,
                message,
            });
        }
        Err(ProviderError::Rejected {
            provider: NAME.to_string(),
            message,
        })
    }

    fn parse_listings(body: &str, currency: &str) -> Result<Vec<Listing>, ProviderError> {
        let value: serde_json::Value = http::parse_json(NAME, body)?;
        Self::check_error_payload(&value)?;
        let response: TopListResponse = http::from_value(NAME, value)?;

        let currency = currency.to_uppercase();
        let total = response.data.len();
        let listings: Vec<Listing> = response
            .data
            .into_iter()
            .filter_map(|entry| {
                let Some(quote) = entry.raw.as_ref().and_then(|raw| raw.get(&currency)) else {
                    tracing::debug!(token = %entry.coin_info.name, currency = %currency, "Skipping listing without a quote");
                    return None;
                };
                Some(Listing {
                    token_id: TokenId::new(entry.coin_info.name.clone()),
                    name: entry.coin_info.full_name.clone(),
                    symbol: entry.coin_info.name.to_uppercase(),
                    price: Price::new(quote.price, currency.clone()),
                    change_24h_pct: quote.change_pct_24h,
                    source: NAME.to_string(),
                })
            })
            .collect();

        if total > 0 && listings.is_empty() {
            return Err(ProviderError::malformed(
                NAME,
                format!("no listing carried a {} quote", currency),
            ));
        }
        Ok(listings)
    }

    fn parse_history(token_id: &TokenId, body: &str) -> Result<HistoricalSeries, ProviderError> {
        let value: serde_json::Value = http::parse_json(NAME, body)?;
        Self::check_error_payload(&value)?;
        let response: HistoDayResponse = http::from_value(NAME, value)?;

        let points = response
            .data
            .data
            .into_iter()
            .map(|candle| {
                let timestamp = Utc.timestamp_opt(candle.time, 0).single().ok_or_else(|| {
                    ProviderError::malformed(NAME, format!("invalid timestamp {}", candle.time))
                })?;
                Ok(HistoricalPoint {
                    token_id: token_id.clone(),
                    timestamp,
                    close: candle.close,
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        Ok(HistoricalSeries::new(token_id.clone(), points))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Apikey {}", key)),
            None => request,
        }
    }
}

#[async_trait]
impl MarketDataProvider for CryptoCompareProvider {
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
        let url = format!("{}/top/mktcapfull", self.base_url);
        tracing::debug!(url = %url, page, page_size, "Fetching listings from CryptoCompare");

        let request = self
            .authorize(self.client.get(&url))
            .query(&Self::listings_query(page, page_size, currency));
        let body = http::get_text(NAME, request).await?;
        let listings = Self::parse_listings(&body, currency)?;

        tracing::debug!(count = listings.len(), "Fetched listings from CryptoCompare");
        Ok(listings)
    }

    async fn fetch_history(
        &self,
        token_id: &TokenId,
        window_days: u32,
        currency: &str,
    ) -> Result<HistoricalSeries, ProviderError> {
        let url = format!("{}/v2/histoday", self.base_url);
        tracing::debug!(url = %url, token = %token_id, window_days, "Fetching history from CryptoCompare");

        let request = self.authorize(self.client.get(&url)).query(&Self::history_query(
            token_id,
            window_days,
            currency,
            Utc::now(),
        ));
        let body = http::get_text(NAME, request).await?;
        Self::parse_history(token_id, &body)
    }
}
