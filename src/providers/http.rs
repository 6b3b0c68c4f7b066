//! HTTP plumbing shared by the provider adapters

use crate::{constants::USER_AGENT, error::ProviderError};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Longest response excerpt carried in an error message
const BODY_EXCERPT_LEN: usize = 200;

/// Builds a client with the engine's user agent and `timeout`
pub(crate) fn build_client(provider: &str, timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ProviderError::from_reqwest(provider, e))
}

/// Sends `request` and returns the body of a successful response
///
/// HTTP 429 becomes [`ProviderError::RateLimited`], any other non-success
/// status becomes [`ProviderError::Http`].
pub(crate) async fn get_text(
    provider: &str,
    request: RequestBuilder,
) -> Result<String, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;

    let status = response.status();

    // Check for rate limiting
    if status.as_u16() == 429 {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::rate_limited(
            provider,
            Some(429),
            excerpt(&body),
        ));
    }

    // Check for other errors
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Http {
            provider: provider.to_string(),
            status: status.as_u16(),
            message: excerpt(&body),
        });
    }

    response
        .text()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))
}

/// Deserializes a JSON document, reporting schema mismatches as `Malformed`
pub(crate) fn parse_json<T: DeserializeOwned>(
    provider: &str,
    body: &str,
) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| {
        ProviderError::malformed(
            provider,
            format!("{}. Response: {}", e, excerpt(body)),
        )
    })
}

/// Converts an already parsed value, reporting mismatches as `Malformed`
pub(crate) fn from_value<T: DeserializeOwned>(
    provider: &str,
    value: serde_json::Value,
) -> Result<T, ProviderError> {
    serde_json::from_value(value).map_err(|e| ProviderError::malformed(provider, e.to_string()))
}

fn excerpt(body: &str) -> String {
    match body.char_indices().nth(BODY_EXCERPT_LEN) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
