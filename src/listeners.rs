//! Event listener registry
//!
//! Listeners run synchronously on the task that produced the event, in
//! registration order. A listener that returns an error or panics is logged
//! and skipped; the remaining listeners still receive the event.

use crate::{error::ListenerError, types::EngineEvent};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Callback invoked for every engine event
pub type Listener = Arc<dyn Fn(&EngineEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered set of listeners
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    // A panicking listener never runs while the lock is held, so a poisoned
    // lock still guards a consistent Vec.
    fn read(&self) -> RwLockReadGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `listener` after all existing ones
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Delivers `event` to every listener; returns how many failed
    pub fn emit(&self, event: &EngineEvent) -> usize {
        // Snapshot so listeners may (un)subscribe from inside the callback
        let listeners: Vec<(ListenerId, Listener)> = self.read().clone();

        let mut failures = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(listener = ?id, event = event.event_type(), event_id = %event.id(), error = %e, "Listener failed");
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(listener = ?id, event = event.event_type(), event_id = %event.id(), "Listener panicked");
                }
            }
        }
        failures
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
