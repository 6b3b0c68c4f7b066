//! In-memory cache of listings and price history

use crate::{
    constants::STALE_THRESHOLD_SECS,
    types::{HistoricalSeries, Listing, TokenId},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// History is keyed per provider because token ids are provider-scoped
type HistoryKey = (String, TokenId);

/// One provider's listings as written by a single successful poll
#[derive(Debug, Clone, PartialEq)]
pub struct ListingsSnapshot {
    /// Provider that produced the listings
    pub provider: String,
    /// Poll cycle that produced the listings
    pub cycle: u64,
    /// When the snapshot was written
    pub fetched_at: DateTime<Utc>,
    pub listings: Vec<Listing>,
}

impl ListingsSnapshot {
    pub fn new(provider: impl Into<String>, cycle: u64, listings: Vec<Listing>) -> Self {
        Self {
            provider: provider.into(),
            cycle,
            fetched_at: Utc::now(),
            listings,
        }
    }

    /// Check if the snapshot is older than threshold seconds
    pub fn is_stale(&self, threshold_seconds: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        age.num_seconds() > threshold_seconds as i64
    }
}

/// Items shown on `page` (1-based), empty when out of range
pub fn paginate<T: Clone>(items: &[T], page: usize, page_size: usize) -> Vec<T> {
    if page == 0 || page_size == 0 {
        return Vec::new();
    }

    let Some(start) = (page - 1).checked_mul(page_size) else {
        return Vec::new();
    };
    if start >= items.len() {
        return Vec::new();
    }

    let end = start.saturating_add(page_size).min(items.len());
    items[start..end].to_vec()
}

/// In-memory store for listings and history
///
/// The listings snapshot is swapped as a whole so readers never observe a
/// mix of two polls. History is replaced one token at a time.
pub struct MarketDataStore {
    listings: RwLock<Option<Arc<ListingsSnapshot>>>,
    /// Series with the poll cycle that fetched it
    history: RwLock<HashMap<HistoryKey, (u64, HistoricalSeries)>>,
}

impl MarketDataStore {
    /// Creates a new empty store
    pub fn new() -> Self {
        Self {
            listings: RwLock::new(None),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Replaces the listings snapshot
    pub async fn replace_listings(&self, snapshot: ListingsSnapshot) {
        let count = snapshot.listings.len();
        let provider = snapshot.provider.clone();
        *self.listings.write().await = Some(Arc::new(snapshot));
        tracing::debug!(count, provider = %provider, "Replaced listings snapshot");
    }

    /// Replaces the history of one token unless a newer cycle already wrote
    /// it. An empty series overwrites too. Returns false when skipped.
    pub async fn upsert_history(
        &self,
        provider: &str,
        cycle: u64,
        series: HistoricalSeries,
    ) -> bool {
        let key = (provider.to_string(), series.token_id().clone());
        let mut history = self.history.write().await;
        if matches!(history.get(&key), Some((written, _)) if *written > cycle) {
            return false;
        }

        tracing::debug!(
            provider,
            cycle,
            token = %series.token_id(),
            points = series.len(),
            "Updated history"
        );
        history.insert(key, (cycle, series));
        true
    }

    /// Latest listings snapshot, if any poll has succeeded
    pub async fn snapshot(&self) -> Option<Arc<ListingsSnapshot>> {
        self.listings.read().await.clone()
    }

    /// Page `page` (1-based) of the latest snapshot
    pub async fn get_listings(&self, page: usize, page_size: usize) -> Vec<Listing> {
        match self.snapshot().await {
            Some(snapshot) => paginate(&snapshot.listings, page, page_size),
            None => Vec::new(),
        }
    }

    /// History of `token_id` as reported by `provider`, empty if never fetched
    pub async fn get_history(&self, provider: &str, token_id: &TokenId) -> HistoricalSeries {
        let key = (provider.to_string(), token_id.clone());
        self.history
            .read()
            .await
            .get(&key)
            .map(|(_, series)| series.clone())
            .unwrap_or_else(|| HistoricalSeries::empty(token_id.clone()))
    }

    /// Checks if history exists for a token
    pub async fn has_history(&self, provider: &str, token_id: &TokenId) -> bool {
        let key = (provider.to_string(), token_id.clone());
        self.history.read().await.contains_key(&key)
    }

    /// True when no snapshot exists or it is older than the stale threshold
    pub async fn is_stale(&self) -> bool {
        match self.snapshot().await {
            Some(snapshot) => snapshot.is_stale(STALE_THRESHOLD_SECS),
            None => true,
        }
    }
}

impl Default for MarketDataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{listings, series};

    #[test]
    fn test_paginate_matches_slice() {
        let items: Vec<u32> = (0..10).collect();

        assert_eq!(paginate(&items, 1, 3), vec![0, 1, 2]);
        assert_eq!(paginate(&items, 2, 3), vec![3, 4, 5]);
        assert_eq!(paginate(&items, 4, 3), vec![9]);
        assert!(paginate(&items, 5, 3).is_empty());
        assert!(paginate(&items, 0, 3).is_empty());
        assert!(paginate(&items, 1, 0).is_empty());
        assert!(paginate(&items, usize::MAX, usize::MAX).is_empty());
    }

    #[tokio::test]
    async fn test_listings_empty_before_first_snapshot() {
        let store = MarketDataStore::new();
        assert!(store.get_listings(1, 3).await.is_empty());
        assert!(store.snapshot().await.is_none());
        assert!(store.is_stale().await);
    }

    #[tokio::test]
    async fn test_snapshot_is_replaced_whole() {
        let store = MarketDataStore::new();
        store
            .replace_listings(ListingsSnapshot::new("a", 1, listings("a", 10)))
            .await;
        store
            .replace_listings(ListingsSnapshot::new("b", 2, listings("b", 4)))
            .await;

        let page = store.get_listings(1, 10).await;
        assert_eq!(page.len(), 4);
        assert!(page.iter().all(|l| l.source == "b"));
        assert!(!store.is_stale().await);
    }

    #[tokio::test]
    async fn test_history_is_per_token_and_per_provider() {
        let store = MarketDataStore::new();
        assert!(store.upsert_history("a", 1, series("btc", &[1.0, 2.0])).await);
        assert!(store.upsert_history("a", 1, series("eth", &[3.0])).await);

        let btc = TokenId::from("btc");
        assert_eq!(store.get_history("a", &btc).await.len(), 2);
        assert!(store.get_history("b", &btc).await.is_empty());
        assert!(!store.has_history("b", &btc).await);

        // an empty successful result overwrites
        assert!(store.upsert_history("a", 2, series("btc", &[])).await);
        assert!(store.get_history("a", &btc).await.is_empty());
        assert!(store.has_history("a", &btc).await);
        assert_eq!(store.get_history("a", &TokenId::from("eth")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_older_cycle_does_not_overwrite_history() {
        let store = MarketDataStore::new();
        let btc = TokenId::from("btc");

        assert!(store.upsert_history("a", 3, series("btc", &[3.0])).await);
        assert!(!store.upsert_history("a", 2, series("btc", &[2.0, 2.5])).await);
        assert_eq!(store.get_history("a", &btc).await.latest().map(|p| p.close), Some(3.0));

        // same cycle rewrites
        assert!(store.upsert_history("a", 3, series("btc", &[4.0])).await);
        assert_eq!(store.get_history("a", &btc).await.latest().map(|p| p.close), Some(4.0));
    }
}
