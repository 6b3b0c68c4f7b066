//! Market data provider implementations

pub mod coingecko;
pub mod coinmarketcap;
pub mod cryptocompare;
mod http;

pub use coingecko::CoinGeckoProvider;
pub use coinmarketcap::CoinMarketCapProvider;
pub use cryptocompare::CryptoCompareProvider;

use crate::{
    config::{EngineConfig, ProviderKind},
    error::ProviderError,
    provider::MarketDataProvider,
};
use std::sync::Arc;

/// Builds the HTTP adapters named by `config`, in configured order
pub fn build_providers(
    config: &EngineConfig,
) -> Result<Vec<Arc<dyn MarketDataProvider>>, ProviderError> {
    let timeout = config.request_timeout();
    let keys = &config.api_keys;

    config
        .providers
        .iter()
        .map(|kind| -> Result<Arc<dyn MarketDataProvider>, ProviderError> {
            Ok(match kind {
                ProviderKind::CoinGecko => {
                    Arc::new(CoinGeckoProvider::new(keys.coingecko.clone(), timeout)?)
                }
                ProviderKind::CryptoCompare => Arc::new(CryptoCompareProvider::new(
                    keys.cryptocompare.clone(),
                    timeout,
                )?),
                ProviderKind::CoinMarketCap => Arc::new(CoinMarketCapProvider::new(
                    keys.coinmarketcap.clone(),
                    timeout,
                )?),
            })
        })
        .collect()
}
