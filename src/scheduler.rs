//! Poll scheduling state machine
//!
//! The scheduler decides *what* happens next and *when*, but never sleeps or
//! performs I/O itself. Every transition returns the delay until the next
//! automatic poll, which the engine turns into a timer. This keeps the whole
//! retry/backoff/failover policy testable without a runtime.
//!
//! ```text
//!            start / refresh / timer
//!   Idle ───────────────────────────▶ Polling
//!    ▲                                 │   │
//!    │ normal interval       ok ◀──────┘   └──────▶ failed
//!    └──────────────── Success            Failed ──┬──▶ Backoff ──(backoff interval)──▶ Idle
//!                                                  └──▶ Terminal (every provider fatal)
//! ```

use crate::{
    classifier::FailureClass,
    error::EngineError,
    types::{EngineStatus, ProviderCapabilities},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Position in the poll state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Waiting for the next timer or a manual refresh
    Idle,
    /// A listings request is in flight
    Polling,
    Success,
    Failed,
    /// Waiting out the backoff interval after a failure
    Backoff,
    /// Every provider failed fatally, nothing is scheduled
    Terminal,
    Stopped,
}

impl SchedulerState {
    /// Transition table
    pub fn can_transition_to(self, next: SchedulerState) -> bool {
        use SchedulerState::*;
        matches!(
            (self, next),
            (Idle, Polling)
                | (Polling, Success)
                | (Polling, Failed)
                | (Success, Idle)
                | (Failed, Backoff)
                | (Failed, Terminal)
                | (Backoff, Idle)
        ) || (next == Stopped && self != Stopped)
    }
}

/// Timing and failover policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Delay before the next poll after a success
    pub normal_interval: Duration,
    /// Delay before the retry after a failure
    pub backoff_interval: Duration,
    /// Consecutive failures before switching provider
    pub failover_threshold: u32,
}

/// Handed out by [`Scheduler::begin_poll`]; results must present it back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTicket {
    pub cycle: u64,
    /// Epoch the poll started in; see [`Scheduler::epoch`]
    pub epoch: u64,
    pub provider: usize,
}

/// A change of active provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSwitch {
    pub from: usize,
    pub to: usize,
}

/// What the engine must do after a failed listings poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Failure count including this failure, before any failover reset
    pub consecutive_failures: u32,
    /// Set when the active provider changed
    pub switched: Option<ProviderSwitch>,
    /// Delay until the retry, `None` once terminal
    pub next_delay: Option<Duration>,
    pub status: EngineStatus,
}

#[derive(Debug)]
struct ProviderSlot {
    name: String,
    capabilities: ProviderCapabilities,
    /// Set after a fatal failure, never cleared
    disabled: bool,
}

impl ProviderSlot {
    fn is_eligible(&self) -> bool {
        self.capabilities.listings && !self.disabled
    }
}

/// Poll state machine for one engine
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    providers: Vec<ProviderSlot>,
    active: usize,
    consecutive_failures: u32,
    cycle: u64,
    epoch: u64,
    status: EngineStatus,
    /// Providers switched away from since the last success, with the class
    /// of the failure that tripped the switch
    rotation: HashMap<usize, FailureClass>,
}

impl Scheduler {
    /// Creates a scheduler over `providers` (name and capabilities, in
    /// round-robin order), starting at `initial` or the next provider after
    /// it that can serve listings.
    pub fn new(
        providers: Vec<(String, ProviderCapabilities)>,
        initial: usize,
        config: SchedulerConfig,
    ) -> Result<Self, EngineError> {
        if providers.is_empty() {
            return Err(EngineError::config("no providers configured"));
        }
        if config.failover_threshold == 0 {
            return Err(EngineError::config("failover threshold must be at least 1"));
        }

        let providers: Vec<ProviderSlot> = providers
            .into_iter()
            .map(|(name, capabilities)| ProviderSlot {
                name,
                capabilities,
                disabled: false,
            })
            .collect();

        let len = providers.len();
        let start = initial % len;
        let active = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| providers[idx].is_eligible())
            .ok_or_else(|| EngineError::config("no provider supports listings"))?;

        Ok(Self {
            config,
            state: SchedulerState::Idle,
            providers,
            active,
            consecutive_failures: 0,
            cycle: 0,
            epoch: 0,
            status: EngineStatus::Starting,
            rotation: HashMap::new(),
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    /// Index of the provider the next poll targets
    pub fn active(&self) -> usize {
        self.active
    }

    pub fn active_name(&self) -> &str {
        &self.providers[self.active].name
    }

    pub fn provider_name(&self, idx: usize) -> &str {
        &self.providers[idx].name
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Current cycle id. Grows on every poll, failover and stop.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Grows only on failover, terminal failure and stop. Polls of the same
    /// provider share an epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// True when results tagged with `cycle` may still be written
    pub fn is_current(&self, cycle: u64) -> bool {
        cycle == self.cycle && !matches!(self.state, SchedulerState::Stopped)
    }

    /// True when history fetched in `epoch` may still be written
    ///
    /// History outlives its poll cycle: a slow history request stays valid
    /// after the next poll of the same provider has started.
    pub fn is_epoch_current(&self, epoch: u64) -> bool {
        epoch == self.epoch && !matches!(self.state, SchedulerState::Stopped)
    }

    fn transition(&mut self, next: SchedulerState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::internal(format!(
                "invalid scheduler transition {:?} -> {:?}",
                self.state, next
            )));
        }
        tracing::trace!(from = ?self.state, to = ?next, cycle = self.cycle, "Scheduler transition");
        self.state = next;
        Ok(())
    }

    fn check_ticket(&self, ticket: PollTicket) -> Result<(), EngineError> {
        if ticket.cycle != self.cycle || self.state != SchedulerState::Polling {
            return Err(EngineError::StaleResult {
                cycle: ticket.cycle,
                current: self.cycle,
            });
        }
        Ok(())
    }

    /// Starts a poll cycle. A pending backoff timer is abandoned.
    pub fn begin_poll(&mut self) -> Result<PollTicket, EngineError> {
        match self.state {
            SchedulerState::Terminal => return Err(EngineError::AllProvidersFatal),
            SchedulerState::Stopped => return Err(EngineError::NotRunning),
            SchedulerState::Backoff => self.transition(SchedulerState::Idle)?,
            _ => {}
        }
        self.transition(SchedulerState::Polling)?;
        self.cycle += 1;

        Ok(PollTicket {
            cycle: self.cycle,
            epoch: self.epoch,
            provider: self.active,
        })
    }

    /// Records a successful listings poll; returns the delay until the next poll
    pub fn on_listings_success(&mut self, ticket: PollTicket) -> Result<Duration, EngineError> {
        self.check_ticket(ticket)?;
        self.transition(SchedulerState::Success)?;

        self.consecutive_failures = 0;
        self.rotation.clear();
        self.status = EngineStatus::Healthy;

        self.transition(SchedulerState::Idle)?;
        Ok(self.config.normal_interval)
    }

    /// Records a failed listings poll and decides on failover
    pub fn on_listings_failure(
        &mut self,
        ticket: PollTicket,
        class: FailureClass,
    ) -> Result<FailureOutcome, EngineError> {
        self.check_ticket(ticket)?;
        self.transition(SchedulerState::Failed)?;

        self.consecutive_failures += 1;
        let failures = self.consecutive_failures;

        self.status = if class == FailureClass::RateLimited
            && self.status == EngineStatus::AllProvidersRateLimited
        {
            EngineStatus::AllProvidersRateLimited
        } else {
            EngineStatus::Retrying
        };

        if class == FailureClass::Fatal {
            self.providers[self.active].disabled = true;
        }

        let mut switched = None;
        if class == FailureClass::Fatal || failures >= self.config.failover_threshold {
            self.rotation.insert(self.active, class);

            let Some(next) = self.next_eligible(self.active) else {
                self.transition(SchedulerState::Terminal)?;
                self.status = EngineStatus::AllProvidersFatal;
                self.cycle += 1;
                self.epoch += 1;
                return Ok(FailureOutcome {
                    consecutive_failures: failures,
                    switched: None,
                    next_delay: None,
                    status: self.status,
                });
            };

            if self.rotation_complete() {
                if self.rotation_all_rate_limited() {
                    self.status = EngineStatus::AllProvidersRateLimited;
                }
                self.rotation.clear();
            }

            if next != self.active {
                switched = Some(ProviderSwitch {
                    from: self.active,
                    to: next,
                });
            }
            self.active = next;
            self.consecutive_failures = 0;
            self.cycle += 1;
            self.epoch += 1;
        }

        self.transition(SchedulerState::Backoff)?;
        Ok(FailureOutcome {
            consecutive_failures: failures,
            switched,
            next_delay: Some(self.config.backoff_interval),
            status: self.status,
        })
    }

    /// Stops the machine and invalidates every outstanding ticket
    pub fn stop(&mut self) {
        if self.state != SchedulerState::Stopped {
            self.state = SchedulerState::Stopped;
            self.status = EngineStatus::Stopped;
            self.cycle += 1;
            self.epoch += 1;
        }
    }

    /// Next eligible provider after `from` in round-robin order, wrapping
    /// around to `from` itself last
    fn next_eligible(&self, from: usize) -> Option<usize> {
        let len = self.providers.len();
        (1..=len)
            .map(|offset| (from + offset) % len)
            .find(|&idx| self.providers[idx].is_eligible())
    }

    fn rotation_complete(&self) -> bool {
        self.providers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_eligible())
            .all(|(idx, _)| self.rotation.contains_key(&idx))
    }

    fn rotation_all_rate_limited(&self) -> bool {
        self.providers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_eligible())
            .all(|(idx, _)| self.rotation.get(&idx) == Some(&FailureClass::RateLimited))
    }
}
