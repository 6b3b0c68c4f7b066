//! Price engine facade
//!
//! Owns the scheduler, the cache, the listener registry and the background
//! timer. Callers hold a [`PriceEngine`] and interact with it through async
//! methods; there is no global instance.

use crate::{
    classifier::classify,
    config::EngineConfig,
    constants::HISTORY_CONCURRENCY,
    error::{EngineError, ListenerError, ProviderError},
    listeners::{ListenerId, ListenerRegistry},
    metrics::{MetricsCollector, ProviderMetrics},
    provider::MarketDataProvider,
    providers::build_providers,
    scheduler::{PollTicket, Scheduler},
    store::{ListingsSnapshot, MarketDataStore},
    types::{
        ComponentHealth, EngineEvent, EngineStatus, HealthStatus, HistoricalSeries, Listing,
        PollError, PollState, TokenId,
    },
};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Summary of one completed poll cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollReport {
    pub cycle: u64,
    pub provider: String,
    /// Listings written to the cache
    pub listings: usize,
    /// History series written to the cache
    pub history_updated: usize,
    /// History requests that failed; their previous series were kept
    pub history_failed: usize,
}

type SharedPoll = Shared<BoxFuture<'static, Result<PollReport, EngineError>>>;

enum HistoryOutcome {
    Updated,
    Failed,
    Stale,
}

struct EngineState {
    scheduler: Scheduler,
    /// Listings phase of the running cycle, joined by concurrent refreshes
    in_flight: Option<(u64, SharedPoll)>,
    /// Deadline of the next automatic poll
    next_poll: Option<Instant>,
    last_update: Option<DateTime<Utc>>,
    last_error: Option<PollError>,
    page: usize,
    /// Set once the background timer runs
    started: bool,
}

struct EngineInner {
    config: EngineConfig,
    providers: Vec<Arc<dyn MarketDataProvider>>,
    store: MarketDataStore,
    metrics: MetricsCollector,
    listeners: ListenerRegistry,
    state: Mutex<EngineState>,
    wake: Notify,
    cancel: CancellationToken,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Market data acquisition engine
///
/// # Example
/// ```no_run
/// use crypto_price_engine::{EngineConfig, PriceEngine};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = PriceEngine::start(EngineConfig::from_env()?).await?;
/// engine.refresh_now().await?;
/// for listing in engine.listings().await {
///     println!("{}: {:.2}", listing.symbol, listing.price.amount);
/// }
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct PriceEngine {
    inner: Arc<EngineInner>,
}

impl PriceEngine {
    /// Creates an idle engine over `providers`, in round-robin order
    ///
    /// Nothing is polled until [`start_polling`](Self::start_polling) or
    /// [`refresh_now`](Self::refresh_now) is called. `config.providers` is
    /// ignored; the adapters passed here are used instead.
    pub fn new(
        config: EngineConfig,
        providers: Vec<Arc<dyn MarketDataProvider>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let names: Vec<&str> = providers.iter().map(|p| p.provider_name()).collect();
        let initial = config.initial_provider.select(&names)?;
        let slots = providers
            .iter()
            .map(|p| (p.provider_name().to_string(), p.capabilities()))
            .collect();
        let scheduler = Scheduler::new(slots, initial, config.scheduler_config())?;

        tracing::info!(
            providers = ?names,
            initial = scheduler.active_name(),
            "Created price engine"
        );

        let state = EngineState {
            scheduler,
            in_flight: None,
            next_poll: None,
            last_update: None,
            last_error: None,
            page: 1,
            started: false,
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                providers,
                store: MarketDataStore::new(),
                metrics: MetricsCollector::new(),
                listeners: ListenerRegistry::new(),
                state: Mutex::new(state),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                driver: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Builds the HTTP adapters named by `config` and starts polling
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        if config.providers.is_empty() {
            return Err(EngineError::config("no providers configured"));
        }
        let providers = build_providers(&config).map_err(|e| EngineError::config(e.to_string()))?;
        let engine = Self::new(config, providers)?;
        engine.start_polling().await?;
        Ok(engine)
    }

    /// Starts the background timer; the first poll runs immediately
    ///
    /// Calling this on a running engine does nothing.
    pub async fn start_polling(&self) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        if state.started {
            return Ok(());
        }
        if self.inner.cancel.is_cancelled() {
            return Err(EngineError::NotRunning);
        }
        state.started = true;
        if state.in_flight.is_none() {
            state.next_poll = Some(Instant::now());
        }
        drop(state);

        let inner = self.inner.clone();
        let handle = tokio::spawn(inner.drive());
        *self
            .inner
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        Ok(())
    }

    /// Polls the active provider now and waits for the cycle to finish
    ///
    /// A pending backoff is abandoned. If a listings request is already in
    /// flight, this joins it instead of issuing another one.
    pub async fn refresh_now(&self) -> Result<PollReport, EngineError> {
        let poll = self.inner.begin_cycle().await?;
        poll.await
    }

    /// Stops polling. Results of requests still in flight are discarded.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();

        let stopped_now = {
            let mut state = self.inner.state.lock().await;
            let was_stopped = state.scheduler.status() == EngineStatus::Stopped;
            state.scheduler.stop();
            state.in_flight = None;
            state.next_poll = None;
            !was_stopped
        };

        let handle = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Price engine background task ended abnormally");
            }
        }

        if stopped_now {
            tracing::info!("Price engine stopped");
            self.inner
                .emit(&EngineEvent::status_changed(EngineStatus::Stopped));
        }
    }

    /// Selects the page shown by [`listings`](Self::listings) and returns it
    ///
    /// Pages start at 1. A page past the end is empty.
    pub async fn set_page(&self, page: usize) -> Result<Vec<Listing>, EngineError> {
        if page == 0 {
            return Err(EngineError::InvalidPage(page));
        }
        self.inner.state.lock().await.page = page;
        self.inner.emit(&EngineEvent::page_changed(page));
        Ok(self.listings_page(page).await)
    }

    /// Listings on the current page
    pub async fn listings(&self) -> Vec<Listing> {
        let page = self.inner.state.lock().await.page;
        self.listings_page(page).await
    }

    /// Listings on `page` without changing the current page
    pub async fn listings_page(&self, page: usize) -> Vec<Listing> {
        self.inner
            .store
            .get_listings(page, self.inner.config.page_size)
            .await
    }

    /// Every listing of the latest snapshot
    pub async fn all_listings(&self) -> Option<Arc<ListingsSnapshot>> {
        self.inner.store.snapshot().await
    }

    /// History of `token_id` from the provider that produced the current
    /// listings. Empty if it was never fetched.
    pub async fn history(&self, token_id: &TokenId) -> HistoricalSeries {
        let provider = match self.inner.store.snapshot().await {
            Some(snapshot) => snapshot.provider.clone(),
            None => return HistoricalSeries::empty(token_id.clone()),
        };
        self.inner.store.get_history(&provider, token_id).await
    }

    pub async fn poll_state(&self) -> PollState {
        let state = self.inner.state.lock().await;
        PollState {
            active_provider: state.scheduler.active_name().to_string(),
            consecutive_failures: state.scheduler.consecutive_failures(),
            last_update: state.last_update,
            last_error: state.last_error.clone(),
            page: state.page,
            cycle: state.scheduler.cycle(),
            scheduler_state: state.scheduler.state(),
            status: state.scheduler.status(),
        }
    }

    pub async fn status(&self) -> EngineStatus {
        self.inner.state.lock().await.scheduler.status()
    }

    /// Registers a listener for engine events
    ///
    /// Listeners run in registration order on the task that produced the
    /// event and must not block.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self.inner.listeners.subscribe(listener);
        tracing::debug!(listener = ?id, total = self.inner.listeners.len(), "Listener subscribed");
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Latency and success rate of listings requests, per provider
    pub async fn provider_metrics(&self) -> Vec<ProviderMetrics> {
        self.inner.metrics.all_metrics().await
    }

    /// Perform a health check on the engine
    pub async fn health_check(&self) -> ComponentHealth {
        let state = self.poll_state().await;
        let snapshot = self.inner.store.snapshot().await;
        let available = snapshot.as_ref().map(|s| s.listings.len()).unwrap_or(0);
        let mut without_history = 0;
        if let Some(snapshot) = &snapshot {
            for listing in &snapshot.listings {
                if !self
                    .inner
                    .store
                    .has_history(&snapshot.provider, &listing.token_id)
                    .await
                {
                    without_history += 1;
                }
            }
        }
        let stale = self.inner.store.is_stale().await;
        let provider_metrics = self.inner.metrics.get_metrics(&state.active_provider).await;

        let mut details = HashMap::new();
        details.insert("available_listings".to_string(), serde_json::json!(available));
        details.insert(
            "active_provider".to_string(),
            serde_json::json!(state.active_provider),
        );
        details.insert(
            "consecutive_failures".to_string(),
            serde_json::json!(state.consecutive_failures),
        );
        details.insert("engine_status".to_string(), serde_json::json!(state.status));
        details.insert("stale".to_string(), serde_json::json!(stale));
        details.insert(
            "tokens_without_history".to_string(),
            serde_json::json!(without_history),
        );
        details.insert(
            "provider_success_rate".to_string(),
            serde_json::json!(provider_metrics.success_rate),
        );
        if let Some(error) = &state.last_error {
            details.insert("last_error".to_string(), serde_json::json!(error.message));
        }

        let status = if state.status.is_terminal() || available == 0 {
            HealthStatus::Unhealthy
        } else if stale || state.status != EngineStatus::Healthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let message = match status {
            HealthStatus::Healthy => "Price engine is operational with fresh data".to_string(),
            HealthStatus::Degraded => format!(
                "Price engine is serving cached data ({:?})",
                state.status
            ),
            HealthStatus::Unhealthy => match state.status {
                EngineStatus::AllProvidersFatal => {
                    "Every provider failed with a fatal error".to_string()
                }
                EngineStatus::Stopped => "Price engine is stopped".to_string(),
                _ => "Price engine has no listings data".to_string(),
            },
        };

        ComponentHealth {
            name: "price_engine".to_string(),
            status,
            message: Some(message),
            details,
            last_checked: Utc::now(),
        }
    }
}

impl Drop for PriceEngine {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl EngineInner {
    fn emit(&self, event: &EngineEvent) {
        if self.listeners.is_empty() {
            return;
        }
        self.listeners.emit(event);
    }

    /// Background timer loop. Runs until the engine is stopped or dropped.
    fn drive(self: Arc<Self>) -> impl Future<Output = ()> + Send + 'static {
        async move {
            tracing::info!(
                refresh_interval_secs = self.config.refresh_interval_secs,
                backoff_interval_secs = self.config.backoff_interval_secs,
                "Starting price engine background task"
            );

            loop {
                let deadline = self.state.lock().await.next_poll;
                let timer = async move {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.wake.notified() => continue,
                    _ = timer => {
                        // The cycle runs on its own task; the timer is re-armed
                        // when its listings phase resolves.
                        if let Err(e) = self.begin_cycle().await {
                            tracing::debug!(error = %e, "Scheduled poll not started");
                            self.state.lock().await.next_poll = None;
                        }
                    }
                }
            }

            tracing::info!("Price engine background task stopped");
        }
    }

    /// Starts a poll cycle, or joins the one whose listings request is in flight
    async fn begin_cycle(self: &Arc<Self>) -> Result<SharedPoll, EngineError> {
        let mut state = self.state.lock().await;
        if let Some((_, poll)) = &state.in_flight {
            return Ok(poll.clone());
        }

        let ticket = state.scheduler.begin_poll()?;
        state.next_poll = None;

        let provider = self.providers[ticket.provider].clone();
        tracing::debug!(
            cycle = ticket.cycle,
            provider = provider.provider_name(),
            "Starting poll cycle"
        );

        let handle = tokio::spawn(self.clone().run_cycle(ticket, provider));
        let poll = async move {
            handle.await.unwrap_or_else(|e| {
                Err(EngineError::internal(format!("poll task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        state.in_flight = Some((ticket.cycle, poll.clone()));
        drop(state);

        // The driver may be sleeping on a deadline that no longer applies
        self.wake.notify_one();
        Ok(poll)
    }

    async fn run_cycle(
        self: Arc<Self>,
        ticket: PollTicket,
        provider: Arc<dyn MarketDataProvider>,
    ) -> Result<PollReport, EngineError> {
        let name = provider.provider_name().to_string();
        let started = Instant::now();

        let result = match tokio::time::timeout(
            self.config.request_timeout(),
            provider.fetch_listings(1, self.config.listings_limit, &self.config.currency),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(&name)),
        };

        let elapsed = started.elapsed();
        self.metrics
            .record_request(&name, elapsed, result.is_ok())
            .await;

        match result {
            Ok(listings) => {
                tracing::debug!(
                    count = listings.len(),
                    provider = %name,
                    latency_ms = elapsed.as_millis() as u64,
                    "Fetched listings"
                );
                self.complete_success(ticket, provider, listings).await
            }
            Err(err) => self.complete_failure(ticket, err).await,
        }
    }

    fn clear_in_flight(state: &mut EngineState, cycle: u64) {
        if matches!(&state.in_flight, Some((in_flight, _)) if *in_flight == cycle) {
            state.in_flight = None;
        }
    }

    async fn complete_success(
        self: Arc<Self>,
        ticket: PollTicket,
        provider: Arc<dyn MarketDataProvider>,
        listings: Vec<Listing>,
    ) -> Result<PollReport, EngineError> {
        let name = provider.provider_name().to_string();
        let tokens: Vec<TokenId> = listings.iter().map(|l| l.token_id.clone()).collect();
        let count = listings.len();

        let status_change = {
            let mut state = self.state.lock().await;
            Self::clear_in_flight(&mut state, ticket.cycle);

            if !state.scheduler.is_current(ticket.cycle) {
                tracing::debug!(
                    cycle = ticket.cycle,
                    current = state.scheduler.cycle(),
                    provider = %name,
                    "Discarding stale listings"
                );
                return Err(EngineError::StaleResult {
                    cycle: ticket.cycle,
                    current: state.scheduler.cycle(),
                });
            }

            let previous = state.scheduler.status();
            let delay = state.scheduler.on_listings_success(ticket)?;

            self.store
                .replace_listings(ListingsSnapshot::new(name.clone(), ticket.cycle, listings))
                .await;
            state.last_update = Some(Utc::now());
            state.last_error = None;
            if state.started {
                state.next_poll = Some(Instant::now() + delay);
            }

            let current = state.scheduler.status();
            (current != previous).then_some(current)
        };
        self.wake.notify_one();

        self.emit(&EngineEvent::listings_updated(ticket.cycle, &name, count));
        if let Some(status) = status_change {
            tracing::info!(status = ?status, provider = %name, "Engine status changed");
            self.emit(&EngineEvent::status_changed(status));
        }

        let (history_updated, history_failed) =
            if self.config.fetch_history && provider.capabilities().history {
                self.fetch_all_history(ticket, provider, tokens).await
            } else {
                (0, 0)
            };

        Ok(PollReport {
            cycle: ticket.cycle,
            provider: name,
            listings: count,
            history_updated,
            history_failed,
        })
    }

    async fn complete_failure(
        self: Arc<Self>,
        ticket: PollTicket,
        err: ProviderError,
    ) -> Result<PollReport, EngineError> {
        let class = classify(&err);
        let mut events = Vec::new();

        {
            let mut state = self.state.lock().await;
            Self::clear_in_flight(&mut state, ticket.cycle);

            if !state.scheduler.is_current(ticket.cycle) {
                tracing::debug!(
                    cycle = ticket.cycle,
                    current = state.scheduler.cycle(),
                    error = %err,
                    "Discarding stale listings failure"
                );
                return Err(EngineError::StaleResult {
                    cycle: ticket.cycle,
                    current: state.scheduler.cycle(),
                });
            }

            let provider = state.scheduler.provider_name(ticket.provider).to_string();
            let previous = state.scheduler.status();
            let outcome = state.scheduler.on_listings_failure(ticket, class)?;

            tracing::warn!(
                provider = %provider,
                class = %class,
                consecutive_failures = outcome.consecutive_failures,
                error = %err,
                "Listings poll failed"
            );

            let poll_error = PollError {
                provider,
                class,
                message: err.to_string(),
                at: Utc::now(),
            };
            events.push(EngineEvent::poll_failed(
                &poll_error,
                outcome.consecutive_failures,
            ));
            state.last_error = Some(poll_error);

            if let Some(switch) = outcome.switched {
                let from = state.scheduler.provider_name(switch.from).to_string();
                let to = state.scheduler.provider_name(switch.to).to_string();
                tracing::warn!(from = %from, to = %to, reason = %class, "Switching provider");
                events.push(EngineEvent::provider_switched(&from, &to, class));
            }

            if outcome.status != previous {
                if outcome.status == EngineStatus::AllProvidersFatal {
                    tracing::error!("Every provider failed with a fatal error, polling stopped");
                } else {
                    tracing::info!(status = ?outcome.status, "Engine status changed");
                }
                events.push(EngineEvent::status_changed(outcome.status));
            }

            state.next_poll = match outcome.next_delay {
                Some(delay) if state.started => Some(Instant::now() + delay),
                _ => None,
            };
        }
        self.wake.notify_one();

        for event in &events {
            self.emit(event);
        }
        Err(EngineError::poll(&err, class))
    }

    /// Fetches history for every listed token; returns (updated, failed)
    async fn fetch_all_history(
        self: Arc<Self>,
        ticket: PollTicket,
        provider: Arc<dyn MarketDataProvider>,
        tokens: Vec<TokenId>,
    ) -> (usize, usize) {
        let outcomes: Vec<HistoryOutcome> = stream::iter(tokens)
            .map(|token| {
                let this = self.clone();
                let provider = provider.clone();
                async move { this.fetch_one_history(ticket, provider, token).await }
            })
            .buffer_unordered(HISTORY_CONCURRENCY)
            .collect()
            .await;

        let updated = outcomes
            .iter()
            .filter(|o| matches!(o, HistoryOutcome::Updated))
            .count();
        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, HistoryOutcome::Failed))
            .count();
        (updated, failed)
    }

    async fn fetch_one_history(
        &self,
        ticket: PollTicket,
        provider: Arc<dyn MarketDataProvider>,
        token: TokenId,
    ) -> HistoryOutcome {
        let name = provider.provider_name();
        let result = match tokio::time::timeout(
            self.config.request_timeout(),
            provider.fetch_history(
                &token,
                self.config.history_window_days,
                &self.config.currency,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::timeout(name)),
        };

        match result {
            Ok(series) => match self
                .commit_history(ticket.cycle, ticket.epoch, name, series)
                .await
            {
                Ok(()) => HistoryOutcome::Updated,
                Err(_) => HistoryOutcome::Stale,
            },
            Err(err) => {
                // History failures never touch the poll state
                tracing::warn!(
                    provider = name,
                    token = %token,
                    class = %classify(&err),
                    error = %err,
                    "History fetch failed, keeping previous series"
                );
                HistoryOutcome::Failed
            }
        }
    }

    /// Writes a history series fetched by poll `cycle`
    ///
    /// Rejected after a failover or stop ended `epoch`, or when a later cycle
    /// already wrote this token.
    async fn commit_history(
        &self,
        cycle: u64,
        epoch: u64,
        provider: &str,
        series: HistoricalSeries,
    ) -> Result<(), EngineError> {
        let event = {
            let state = self.state.lock().await;
            let stale = EngineError::StaleResult {
                cycle,
                current: state.scheduler.cycle(),
            };
            if !state.scheduler.is_epoch_current(epoch) {
                tracing::debug!(
                    cycle,
                    epoch,
                    current_epoch = state.scheduler.epoch(),
                    token = %series.token_id(),
                    "Discarding history from a superseded provider epoch"
                );
                return Err(stale);
            }

            let event = EngineEvent::history_updated(cycle, provider, &series);
            let token = series.token_id().clone();
            if !self.store.upsert_history(provider, cycle, series).await {
                tracing::debug!(cycle, token = %token, "Discarding history older than the cached series");
                return Err(stale);
            }
            event
        };

        self.emit(&event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FailureClass;
    use crate::config::InitialProvider;
    use crate::provider::mock::{listings, series, MockProvider};
    use crate::scheduler::SchedulerState;
    use crate::types::ProviderCapabilities;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            providers: Vec::new(),
            ..EngineConfig::default()
        }
    }

    fn engine(providers: &[Arc<MockProvider>], config: EngineConfig) -> PriceEngine {
        let providers = providers
            .iter()
            .map(|p| p.clone() as Arc<dyn MarketDataProvider>)
            .collect();
        PriceEngine::new(config, providers).unwrap()
    }

    fn http_error(provider: &str, status: u16) -> ProviderError {
        ProviderError::Http {
            provider: provider.to_string(),
            status,
            message: "upstream error".to_string(),
        }
    }

    fn record_events(engine: &PriceEngine) -> Arc<StdMutex<Vec<&'static str>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        engine.subscribe(move |event| {
            sink.lock().unwrap().push(event.event_type());
            Ok(())
        });
        seen
    }

    fn ids(listings: &[Listing]) -> Vec<&str> {
        listings.iter().map(|l| l.token_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_refresh_and_pagination() {
        let a = Arc::new(MockProvider::new("a"));
        let engine = engine(&[a.clone()], config());

        let report = engine.refresh_now().await.unwrap();
        assert_eq!(report.provider, "a");
        assert_eq!(report.listings, 10);
        assert_eq!(report.history_updated, 10);
        assert_eq!(report.history_failed, 0);

        assert_eq!(ids(&engine.listings().await), vec!["t0", "t1", "t2"]);

        let page = engine.set_page(2).await.unwrap();
        assert_eq!(ids(&page), vec!["t3", "t4", "t5"]);
        assert_eq!(ids(&engine.listings().await), vec!["t3", "t4", "t5"]);
        assert_eq!(engine.poll_state().await.page, 2);

        assert!(engine.set_page(5).await.unwrap().is_empty());
        assert_eq!(engine.set_page(0).await, Err(EngineError::InvalidPage(0)));
        assert_eq!(engine.poll_state().await.page, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_request() {
        let a = Arc::new(MockProvider::new("a"));
        a.set_listings_delay(Duration::from_secs(1));
        let engine = engine(&[a.clone()], config());

        let (first, second) = tokio::join!(engine.refresh_now(), engine.refresh_now());

        assert!(first.is_ok());
        assert_eq!(first, second);
        assert_eq!(a.listings_call_count(), 1);
    }

    #[tokio::test]
    async fn test_failover_after_three_failures() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        a.set_listings_error(http_error("a", 503));
        let engine = engine(&[a.clone(), b.clone()], config());
        let events = record_events(&engine);

        for _ in 0..3 {
            let result = engine.refresh_now().await;
            assert!(matches!(
                result,
                Err(EngineError::Poll {
                    class: FailureClass::Transient,
                    ..
                })
            ));
        }

        let state = engine.poll_state().await;
        assert_eq!(state.active_provider, "b");
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.status, EngineStatus::Retrying);
        assert_eq!(state.last_error.as_ref().map(|e| e.provider.as_str()), Some("a"));
        assert!(events.lock().unwrap().contains(&"PROVIDER_SWITCHED"));

        let report = engine.refresh_now().await.unwrap();
        assert_eq!(report.provider, "b");
        assert_eq!(a.listings_call_count(), 3);
        assert_eq!(b.listings_call_count(), 1);

        let state = engine.poll_state().await;
        assert_eq!(state.status, EngineStatus::Healthy);
        assert!(state.last_error.is_none());
        assert_eq!(engine.history(&TokenId::from("t0")).await.len(), 2);
    }

    #[tokio::test]
    async fn test_history_failure_is_isolated() {
        let a = Arc::new(MockProvider::new("a"));
        let engine = engine(&[a.clone()], config());
        engine.refresh_now().await.unwrap();

        a.set_history_error("t1", http_error("a", 500));
        a.set_history(series("t2", &[5.0, 6.0, 7.0]));
        let report = engine.refresh_now().await.unwrap();

        assert_eq!(report.history_failed, 1);
        assert_eq!(report.history_updated, 9);
        assert_eq!(engine.history(&TokenId::from("t1")).await.len(), 2);
        assert_eq!(engine.history(&TokenId::from("t2")).await.len(), 3);

        let state = engine.poll_state().await;
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_error.is_none());
        assert_eq!(state.status, EngineStatus::Healthy);
    }

    #[tokio::test]
    async fn test_history_from_old_cycle_is_rejected() {
        let a = Arc::new(MockProvider::new("a"));
        let engine = engine(&[a.clone()], config());
        engine.refresh_now().await.unwrap();
        engine.refresh_now().await.unwrap();

        let result = engine
            .inner
            .commit_history(1, 0, "a", series("t0", &[9.0]))
            .await;
        assert_eq!(result, Err(EngineError::StaleResult { cycle: 1, current: 2 }));

        let history = engine.history(&TokenId::from("t0")).await;
        assert_eq!(history.latest().map(|p| p.close), Some(2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_after_stop_are_discarded() {
        let a = Arc::new(MockProvider::new("a"));
        a.set_history_delay(Duration::from_secs(5));
        let engine = Arc::new(engine(&[a.clone()], config()));

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.refresh_now().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.listings().await.len(), 3);

        engine.stop().await;
        let report = task.await.unwrap().unwrap();

        assert_eq!(report.history_updated, 0);
        assert!(engine.history(&TokenId::from("t0")).await.is_empty());
        assert_eq!(engine.status().await, EngineStatus::Stopped);
        assert_eq!(engine.refresh_now().await, Err(EngineError::NotRunning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_uses_backoff_then_normal_interval() {
        let a = Arc::new(MockProvider::new("a"));
        a.push_listings(Err(http_error("a", 503)));
        let engine = engine(&[a.clone()], config());

        engine.start_polling().await.unwrap();
        tokio::time::sleep(Duration::from_secs(75)).await;
        engine.stop().await;

        let times = a.listings_call_times();
        assert_eq!(times.len(), 3);

        let backoff = times[1] - times[0];
        let normal = times[2] - times[1];
        assert!(backoff >= Duration::from_secs(60) && backoff < Duration::from_secs(61));
        assert!(normal >= Duration::from_secs(10) && normal < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_does_not_wait_for_history() {
        let a = Arc::new(MockProvider::new("a"));
        a.set_history_delay(Duration::from_secs(25));
        let engine = engine(
            &[a.clone()],
            EngineConfig {
                request_timeout_secs: 30,
                ..config()
            },
        );

        engine.start_polling().await.unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;
        engine.stop().await;

        let times = a.listings_call_times();
        assert_eq!(times.len(), 5);
        for pair in times.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_secs(10) && gap < Duration::from_secs(11));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_history_outlives_next_poll() {
        // Three rounds of 4s requests finish after the next 10s poll starts
        let a = Arc::new(MockProvider::new("a"));
        a.set_history_delay(Duration::from_secs(4));
        let engine = engine(&[a.clone()], config());

        engine.start_polling().await.unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;

        for i in 0..10 {
            let token = TokenId::new(format!("t{}", i));
            assert_eq!(engine.history(&token).await.len(), 2, "no history for {}", token);
        }
        let health = engine.health_check().await;
        assert_eq!(health.details["tokens_without_history"], serde_json::json!(0));
        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_listings_timeout_is_transient() {
        let a = Arc::new(MockProvider::new("a"));
        a.set_listings_delay(Duration::from_secs(30));
        let engine = engine(&[a.clone()], config());

        let result = engine.refresh_now().await;
        assert!(matches!(
            result,
            Err(EngineError::Poll {
                class: FailureClass::Transient,
                ..
            })
        ));

        let metrics = engine.provider_metrics().await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].failed_requests, 1);
    }

    #[tokio::test]
    async fn test_all_providers_fatal_is_terminal() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        a.set_listings_error(http_error("a", 401));
        b.set_listings_error(http_error("b", 403));
        let engine = engine(&[a.clone(), b.clone()], config());
        let events = record_events(&engine);

        assert!(matches!(
            engine.refresh_now().await,
            Err(EngineError::Poll {
                class: FailureClass::Fatal,
                ..
            })
        ));
        assert_eq!(engine.poll_state().await.active_provider, "b");

        assert!(engine.refresh_now().await.is_err());
        let state = engine.poll_state().await;
        assert_eq!(state.status, EngineStatus::AllProvidersFatal);
        assert_eq!(state.scheduler_state, SchedulerState::Terminal);

        assert_eq!(
            engine.refresh_now().await,
            Err(EngineError::AllProvidersFatal)
        );
        assert_eq!(a.listings_call_count(), 1);
        assert_eq!(b.listings_call_count(), 1);

        let seen = events.lock().unwrap().clone();
        assert!(seen.contains(&"PROVIDER_SWITCHED"));
        assert!(seen.contains(&"STATUS_CHANGED"));
        assert_eq!(engine.health_check().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_all_providers_rate_limited_recovers() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        a.set_listings_error(ProviderError::rate_limited("a", Some(429), "slow down"));
        b.set_listings_error(ProviderError::rate_limited("b", Some(429), "slow down"));
        let engine = engine(
            &[a.clone(), b.clone()],
            EngineConfig {
                failover_threshold: 1,
                ..config()
            },
        );

        assert!(engine.refresh_now().await.is_err());
        assert_eq!(engine.status().await, EngineStatus::Retrying);
        assert!(engine.refresh_now().await.is_err());

        let state = engine.poll_state().await;
        assert_eq!(state.status, EngineStatus::AllProvidersRateLimited);
        let error = state.last_error.unwrap();
        assert_eq!(error.provider, "b");
        assert_eq!(error.class, FailureClass::RateLimited);

        a.set_listings(listings("a", 10));
        engine.refresh_now().await.unwrap();
        assert_eq!(engine.status().await, EngineStatus::Healthy);
        assert_eq!(engine.health_check().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_listener_failures_do_not_block_delivery() {
        let a = Arc::new(MockProvider::new("a"));
        let engine = engine(&[a.clone()], config());

        engine.subscribe(|_| Err("listener failed".into()));
        engine.subscribe(|_| panic!("listener panicked"));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let id = engine.subscribe(move |event| {
            sink.lock().unwrap().push(event.event_type());
            Ok(())
        });

        engine.refresh_now().await.unwrap();
        {
            let seen = seen.lock().unwrap();
            assert_eq!(&seen[..2], &["LISTINGS_UPDATED", "STATUS_CHANGED"]);
            assert_eq!(seen.iter().filter(|t| **t == "HISTORY_UPDATED").count(), 10);
        }

        assert!(engine.unsubscribe(id));
        let delivered = seen.lock().unwrap().len();
        engine.refresh_now().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), delivered);
    }

    #[tokio::test]
    async fn test_named_initial_provider() {
        let a = Arc::new(MockProvider::new("a"));
        let b = Arc::new(MockProvider::new("b"));
        let engine = engine(
            &[a.clone(), b.clone()],
            EngineConfig {
                initial_provider: InitialProvider::Named("b".to_string()),
                ..config()
            },
        );

        assert_eq!(engine.poll_state().await.active_provider, "b");
        assert_eq!(engine.refresh_now().await.unwrap().provider, "b");
        assert_eq!(a.listings_call_count(), 0);
    }

    #[tokio::test]
    async fn test_history_skipped_without_capability() {
        let a = Arc::new(MockProvider::new("a").with_capabilities(ProviderCapabilities {
            listings: true,
            history: false,
        }));
        let engine = engine(&[a.clone()], config());

        let report = engine.refresh_now().await.unwrap();
        assert_eq!(report.history_updated, 0);
        assert_eq!(a.history_call_count(), 0);
        assert!(engine.history(&TokenId::from("t0")).await.is_empty());
    }

    #[tokio::test]
    async fn test_health_before_first_poll() {
        let a = Arc::new(MockProvider::new("a"));
        let engine = engine(&[a], config());

        let health = engine.health_check().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.details["available_listings"], serde_json::json!(0));
        assert_eq!(engine.status().await, EngineStatus::Starting);
    }

    #[tokio::test]
    async fn test_health_counts_tokens_without_history() {
        let a = Arc::new(MockProvider::new("a"));
        a.set_history_error("t3", http_error("a", 500));
        let engine = engine(&[a.clone()], config());
        engine.refresh_now().await.unwrap();

        let health = engine.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.details["available_listings"], serde_json::json!(10));
        assert_eq!(health.details["tokens_without_history"], serde_json::json!(1));
        assert_eq!(health.details["provider_success_rate"], serde_json::json!(1.0));
    }
}
