//! CoinMarketCap provider implementation
//!
//! Listings are paged by a 1-based `start` offset rather than a page number.

use crate::{
    constants::COINMARKETCAP_API_URL,
    error::ProviderError,
    provider::MarketDataProvider,
    providers::http,
    types::{HistoricalPoint, HistoricalSeries, Listing, Price, ProviderCapabilities, TokenId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const NAME: &str = "coinmarketcap";

/// `status.error_code` values that mean the plan's rate limit was hit
const RATE_LIMIT_CODES: std::ops::RangeInclusive<u64> = 1008..=1011;

/// `status.error_code` values for an invalid or missing API key
const AUTH_ERROR_CODES: [u64; 2] = [1001, 1002];

#[derive(Debug, Deserialize)]
struct ListingsResponse {
    data: Vec<ListingEntry>,
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    id: u64,
    name: String,
    symbol: String,
    #[serde(default)]
    quote: HashMap<String, ListingQuote>,
}

#[derive(Debug, Deserialize)]
struct ListingQuote {
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    percent_change_24h: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OhlcvResponse {
    data: OhlcvData,
}

/// A single-id request returns the asset directly; some plans key it by id
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OhlcvData {
    Single(OhlcvAsset),
    Keyed(HashMap<String, OhlcvAsset>),
}

#[derive(Debug, Deserialize)]
struct OhlcvAsset {
    quotes: Vec<OhlcvQuote>,
}

#[derive(Debug, Deserialize)]
struct OhlcvQuote {
    time_close: DateTime<Utc>,
    quote: HashMap<String, OhlcvClose>,
}

#[derive(Debug, Deserialize)]
struct OhlcvClose {
    close: f64,
}

/// CoinMarketCap provider
pub struct CoinMarketCapProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CoinMarketCapProvider {
    /// Creates a new CoinMarketCap provider
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http::build_client(NAME, timeout)?,
            base_url: COINMARKETCAP_API_URL.to_string(),
            api_key,
        })
    }

    /// Points the provider at another host, e.g. the sandbox API
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Offset of the first token on `page`: `(page - 1) * page_size + 1`
    fn start_offset(page: u32, page_size: u32) -> u64 {
        u64::from(page.saturating_sub(1)) * u64::from(page_size) + 1
    }

    fn listings_query(page: u32, page_size: u32, currency: &str) -> Vec<(&'static str, String)> {
        vec![
            ("start", Self::start_offset(page, page_size).to_string()),
            ("limit", page_size.to_string()),
            ("convert", currency.to_uppercase()),
        ]
    }

    fn history_query(
        token_id: &TokenId,
        window_days: u32,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let start = now - chrono::Duration::days(i64::from(window_days));
        vec![
            ("id", token_id.as_str().to_string()),
            ("time_start", start.timestamp().to_string()),
            ("time_end", now.timestamp().to_string()),
            ("convert", currency.to_uppercase()),
        ]
    }

    fn check_error_payload(value: &serde_json::Value) -> Result<(), ProviderError> {
        let Some(status) = value.get("status") else {
            return Ok(());
        };
        let code = status
            .get("error_code")
            .and_then(|c| c.as_u64())
            .unwrap_or(0);
        if code == 0 {
            return Ok(());
        }

        let message = status
            .get("error_message")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();

        if RATE_LIMIT_CODES.contains(&code) {
            return Err(ProviderError::rate_limited(NAME, None, message));
        }
        if AUTH_ERROR_CODES.contains(&code) {
            return Err(ProviderError::Http {
                provider: NAME.to_string(),
                status: 401,
                message,
            });
        }
        Err(ProviderError::Rejected {
            provider: NAME.to_string(),
            message: format!("error {}: {}", code, message),
        })
    }

    fn parse_listings(body: &str, currency: &str) -> Result<Vec<Listing>, ProviderError> {
        let value: serde_json::Value = http::parse_json(NAME, body)?;
        Self::check_error_payload(&value)?;
        let response: ListingsResponse = http::from_value(NAME, value)?;

        let currency = currency.to_uppercase();
        let total = response.data.len();
        let listings: Vec<Listing> = response
            .data
            .into_iter()
            .filter_map(|entry| {
                let quote = entry.quote.get(&currency);
                let Some(price) = quote.and_then(|q| q.price) else {
                    tracing::debug!(token = entry.id, symbol = %entry.symbol, currency = %currency, "Skipping listing without a quote");
                    return None;
                };
                Some(Listing {
                    token_id: TokenId::new(entry.id.to_string()),
                    name: entry.name.clone(),
                    symbol: entry.symbol.to_uppercase(),
                    price: Price::new(price, currency.clone()),
                    change_24h_pct: quote.and_then(|q| q.percent_change_24h),
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

    fn parse_history(
        token_id: &TokenId,
        body: &str,
        currency: &str,
    ) -> Result<HistoricalSeries, ProviderError> {
        let value: serde_json::Value = http::parse_json(NAME, body)?;
        Self::check_error_payload(&value)?;
        let response: OhlcvResponse = http::from_value(NAME, value)?;

        let asset = match response.data {
            OhlcvData::Single(asset) => asset,
            OhlcvData::Keyed(mut by_id) => by_id.remove(token_id.as_str()).ok_or_else(|| {
                ProviderError::malformed(NAME, format!("no history for id {}", token_id))
            })?,
        };

        let currency = currency.to_uppercase();
        let points = asset
            .quotes
            .into_iter()
            .map(|q| {
                let close = q.quote.get(&currency).ok_or_else(|| {
                    ProviderError::malformed(NAME, format!("missing {} close", currency))
                })?;
                Ok(HistoricalPoint {
                    token_id: token_id.clone(),
                    timestamp: q.time_close,
                    close: close.close,
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        Ok(HistoricalSeries::new(token_id.clone(), points))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-CMC_PRO_API_KEY", key),
            None => request,
        }
    }
}

#[async_trait]
impl MarketDataProvider for CoinMarketCapProvider {
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
        let url = format!("{}/v1/cryptocurrency/listings/latest", self.base_url);
        tracing::debug!(url = %url, page, page_size, "Fetching listings from CoinMarketCap");

        let request = self
            .authorize(self.client.get(&url))
            .query(&Self::listings_query(page, page_size, currency));
        let body = http::get_text(NAME, request).await?;
        let listings = Self::parse_listings(&body, currency)?;

        tracing::debug!(count = listings.len(), "Fetched listings from CoinMarketCap");
        Ok(listings)
    }

    async fn fetch_history(
        &self,
        token_id: &TokenId,
        window_days: u32,
        currency: &str,
    ) -> Result<HistoricalSeries, ProviderError> {
        let url = format!("{}/v2/cryptocurrency/ohlcv/historical", self.base_url);
        tracing::debug!(url = %url, token = %token_id, window_days, "Fetching history from CoinMarketCap");

        let request = self.authorize(self.client.get(&url)).query(&Self::history_query(
            token_id,
            window_days,
            currency,
            Utc::now(),
        ));
        let body = http::get_text(NAME, request).await?;
        Self::parse_history(token_id, &body, currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_start_offset() {
        assert_eq!(CoinMarketCapProvider::start_offset(1, 10), 1);
        assert_eq!(CoinMarketCapProvider::start_offset(2, 10), 11);
        assert_eq!(CoinMarketCapProvider::start_offset(3, 3), 7);

        let query = CoinMarketCapProvider::listings_query(2, 3, "usd");
        assert!(query.contains(&("start", "4".to_string())));
        assert!(query.contains(&("limit", "3".to_string())));
        assert!(query.contains(&("convert", "USD".to_string())));
    }

    #[test]
    fn test_history_query_window() {
        let now = Utc.timestamp_opt(1_700_604_800, 0).unwrap();
        let query =
            CoinMarketCapProvider::history_query(&TokenId::from("1"), 7, "USD", now);
        assert!(query.contains(&("id", "1".to_string())));
        assert!(query.contains(&("time_start", "1700000000".to_string())));
        assert!(query.contains(&("time_end", "1700604800".to_string())));
    }

    #[test]
    fn test_parse_listings() {
        let body = json!({
            "status": { "error_code": 0, "error_message": null },
            "data": [
                {
                    "id": 1,
                    "name": "Bitcoin",
                    "symbol": "BTC",
                    "quote": { "USD": { "price": 64000.0, "percent_change_24h": 0.75 } }
                }
            ]
        })
        .to_string();

        let listings = CoinMarketCapProvider::parse_listings(&body, "USD").unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].token_id.as_str(), "1");
        assert_eq!(listings[0].symbol, "BTC");
        assert_eq!(listings[0].change_24h_pct, Some(0.75));
    }

    #[test]
    fn test_listing_without_price_is_skipped() {
        let body = json!({
            "status": { "error_code": 0 },
            "data": [
                { "id": 1, "name": "Bitcoin", "symbol": "BTC", "quote": { "USD": { "price": 64000.0 } } },
                { "id": 99, "name": "New Coin", "symbol": "NEW", "quote": { "USD": { "price": null } } },
                { "id": 1027, "name": "Ethereum", "symbol": "ETH", "quote": {} }
            ]
        })
        .to_string();
        let listings = CoinMarketCapProvider::parse_listings(&body, "USD").unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].token_id.as_str(), "1");

        let body = json!({ "status": { "error_code": 0 } }).to_string();
        let err = CoinMarketCapProvider::parse_listings(&body, "USD").unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
    }

    #[test]
    fn test_error_codes() {
        let rate_limited = json!({
            "status": { "error_code": 1008, "error_message": "You've exceeded your API Key's HTTP request rate limit." }
        })
        .to_string();
        let err = CoinMarketCapProvider::parse_listings(&rate_limited, "USD").unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));

        let bad_key = json!({
            "status": { "error_code": 1001, "error_message": "This API Key is invalid." }
        })
        .to_string();
        let err = CoinMarketCapProvider::parse_listings(&bad_key, "USD").unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    #[test]
    fn test_parse_history_both_shapes() {
        let quotes = json!([
            { "time_close": "2023-11-15T23:59:59.999Z", "quote": { "USD": { "close": 37000.0 } } },
            { "time_close": "2023-11-14T23:59:59.999Z", "quote": { "USD": { "close": 35500.0 } } }
        ]);
        let token = TokenId::from("1");

        let single = json!({ "data": { "id": 1, "quotes": quotes.clone() } }).to_string();
        let series = CoinMarketCapProvider::parse_history(&token, &single, "USD").unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.points()[0].close, 35500.0);

        let keyed = json!({ "data": { "1": { "id": 1, "quotes": quotes } } }).to_string();
        let series = CoinMarketCapProvider::parse_history(&token, &keyed, "USD").unwrap();
        assert_eq!(series.latest().map(|p| p.close), Some(37000.0));
    }
}
