//! At most one active saga per content key.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::errors::{Result, VdpflowError};

/// What to do when a key is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightMode {
    /// Fail with [`VdpflowError::InFlight`].
    #[default]
    Reject,
    /// Wait for the running flight to finish.
    Wait,
}

/// Tracks the content keys currently being processed.
#[derive(Debug, Default)]
pub struct SingleFlight {
    in_flight: DashMap<String, Arc<Notify>>,
}

/// Held while a key is in flight; releases it on drop.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
    key: String,
    notify: Arc<Notify>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flight
            .in_flight
            .remove_if(&self.key, |_, n| Arc::ptr_eq(n, &self.notify));
        self.notify.notify_waiters();
    }
}

impl SingleFlight {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key` or fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::InFlight`] if `key` is already claimed.
    pub fn try_acquire(&self, key: &str) -> Result<FlightGuard<'_>> {
        match self.in_flight.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                let notify = Arc::new(Notify::new());
                slot.insert(notify.clone());
                Ok(FlightGuard {
                    flight: self,
                    key: key.to_string(),
                    notify,
                })
            }
            Entry::Occupied(_) => Err(VdpflowError::InFlight {
                content_key: key.to_string(),
            }),
        }
    }

    /// Claims `key`, waiting for any running flight to finish first.
    pub async fn acquire(&self, key: &str) -> FlightGuard<'_> {
        loop {
            let notify = match self.try_acquire(key) {
                Ok(guard) => return guard,
                Err(_) => match self.in_flight.get(key) {
                    Some(current) => Arc::clone(current.value()),
                    None => continue,
                },
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a release in between is not missed.
            notified.as_mut().enable();
            let still_held = self
                .in_flight
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current.value(), &notify));
            if still_held {
                debug!(content_key = %key, "Waiting for in-flight item");
                notified.await;
            }
        }
    }

    /// Claims `key` according to `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`VdpflowError::InFlight`] in [`FlightMode::Reject`] when busy.
    pub async fn claim(&self, key: &str, mode: FlightMode) -> Result<FlightGuard<'_>> {
        match mode {
            FlightMode::Reject => self.try_acquire(key),
            FlightMode::Wait => Ok(self.acquire(key).await),
        }
    }

    /// Returns true if `key` is claimed.
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Number of claimed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns true if nothing is claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}
