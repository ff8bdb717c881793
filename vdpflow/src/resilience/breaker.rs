//! Per-backend circuit breaker.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests are skipped
//! - Half-Open: cooldown elapsed, the next request decides
//!
//! # State Transitions
//! ```text
//! Closed    -> Open:      consecutive failures >= threshold
//! Open      -> Half-Open: cooldown elapsed since the last failure
//! Half-Open -> Closed:    next call succeeds
//! Half-Open -> Open:      next call fails
//! ```
//!
//! Breakers are shared by every task routing to the same backend, so all
//! reads and updates go through one mutex per breaker.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::utils::{format_rfc3339, now_utc, Timestamp};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Requests pass through.
    #[default]
    Closed,
    /// Requests are skipped until the cooldown elapses.
    Open,
    /// One trial outcome decides between closed and open.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown after the last failure before a trial request, in ms.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Number of response times kept for latency statistics.
    #[serde(default = "default_response_window")]
    pub response_window: usize,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_response_window() -> usize {
    100
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            response_window: default_response_window(),
        }
    }
}

impl BreakerConfig {
    /// Creates a new breaker config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the cooldown.
    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the cooldown as a duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Serializable view of a breaker, including latency statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Backend name.
    pub name: String,
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures.
    pub failures: u32,
    /// Threshold that opens the breaker.
    pub failure_threshold: u32,
    /// Last failure (RFC 3339).
    pub last_failure: Option<String>,
    /// Last state change (RFC 3339).
    pub last_state_change: String,
    /// Calls recorded since creation.
    pub total_requests: u64,
    /// Successful calls since creation.
    pub total_successes: u64,
    /// Failed calls since creation.
    pub total_failures: u64,
    /// Success rate in percent.
    pub success_rate: f64,
    /// Mean response time over the window, in ms.
    pub avg_response_ms: f64,
    /// 95th percentile response time over the window, in ms.
    pub p95_response_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<Timestamp>,
    last_state_change: Timestamp,
    // Admission time of the single half-open trial.
    trial_started: Option<Instant>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    response_times_ms: VecDeque<u64>,
}

impl BreakerInner {
    fn transition(&mut self, name: &str, to: BreakerState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.last_state_change = now_utc();
        match to {
            BreakerState::Open => {
                warn!(backend = %name, %from, failures = self.failures, "Circuit breaker opened");
            }
            BreakerState::HalfOpen => {
                info!(backend = %name, %from, "Circuit breaker half-open, allowing trial request");
            }
            BreakerState::Closed => {
                info!(backend = %name, %from, "Circuit breaker closed");
            }
        }
    }

    fn record_response_time(&mut self, elapsed: Duration, window: usize) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.response_times_ms.push_back(ms);
        while self.response_times_ms.len() > window.max(1) {
            self.response_times_ms.pop_front();
        }
    }
}

/// A circuit breaker guarding one backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                last_failure_at: None,
                last_state_change: now_utc(),
                trial_started: None,
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
                response_times_ms: VecDeque::new(),
            }),
        }
    }

    /// Returns the backend name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Decides whether a request may be sent now.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open and
    /// admits that one request as its trial. Half-open admits nothing else
    /// until the trial is recorded; a trial that never reports back frees its
    /// slot after another cooldown.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        let cooldown = self.config.cooldown();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                let free = inner.trial_started.map_or(true, |at| at.elapsed() >= cooldown);
                if free {
                    inner.trial_started = Some(Instant::now());
                }
                free
            }
            BreakerState::Open => {
                let cooled_down = inner.last_failure.map_or(true, |at| at.elapsed() >= cooldown);
                if cooled_down {
                    inner.transition(&self.name, BreakerState::HalfOpen);
                    inner.trial_started = Some(Instant::now());
                }
                cooled_down
            }
        }
    }

    /// Records a successful call: failures reset, breaker closes.
    pub fn record_success(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        inner.total_successes += 1;
        inner.failures = 0;
        inner.trial_started = None;
        inner.record_response_time(elapsed, self.config.response_window);
        inner.transition(&self.name, BreakerState::Closed);
    }

    /// Records a failed call or probe.
    pub fn record_failure(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        inner.total_failures += 1;
        inner.failures = inner.failures.saturating_add(1);
        inner.trial_started = None;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(now_utc());
        inner.record_response_time(elapsed, self.config.response_window);

        let open = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };
        if open {
            inner.transition(&self.name, BreakerState::Open);
        }
    }

    /// Opens the breaker immediately, restarting the cooldown.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.trial_started = None;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(now_utc());
        inner.transition(&self.name, BreakerState::Open);
    }

    /// Closes the breaker and clears the failure count.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.last_failure = None;
        inner.trial_started = None;
        inner.transition(&self.name, BreakerState::Closed);
    }

    /// Returns the stored state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Returns the consecutive failure count.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    /// Returns a serializable view with latency statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();

        let success_rate = if inner.total_requests == 0 {
            100.0
        } else {
            inner.total_successes as f64 / inner.total_requests as f64 * 100.0
        };

        let avg_response_ms = if inner.response_times_ms.is_empty() {
            0.0
        } else {
            inner.response_times_ms.iter().sum::<u64>() as f64
                / inner.response_times_ms.len() as f64
        };

        let p95_response_ms = {
            let mut sorted: Vec<u64> = inner.response_times_ms.iter().copied().collect();
            sorted.sort_unstable();
            if sorted.is_empty() {
                0
            } else {
                let rank = (sorted.len() * 95).div_ceil(100);
                sorted[rank.saturating_sub(1)]
            }
        };

        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            failure_threshold: self.config.failure_threshold,
            last_failure: inner.last_failure_at.as_ref().map(format_rfc3339),
            last_state_change: format_rfc3339(&inner.last_state_change),
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            success_rate,
            avg_response_ms,
            p95_response_ms,
        }
    }
}

/// Process-wide registry handing out one breaker per backend name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the breaker for `name`, creating it with `config` if needed.
    pub fn get_or_create(&self, name: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .clone()
    }

    /// Returns the breaker for `name`, if one exists.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Returns every registered breaker.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|b| b.value().clone()).collect()
    }

    /// Returns snapshots sorted by backend name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Returns the number of breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breakers exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "t3-primary",
            BreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_cooldown(Duration::from_millis(cooldown_ms)),
        )
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let cb = breaker(3, 60_000);

        cb.record_failure(Duration::ZERO);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.failures(), 3);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 60_000);
        cb.record_failure(Duration::ZERO);
        cb.record_failure(Duration::ZERO);
        cb.record_success(Duration::from_millis(5));
        cb.record_failure(Duration::ZERO);

        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_cooldown_then_success_closes() {
        let cb = breaker(2, 20);
        cb.record_failure(Duration::ZERO);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(40));

        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success(Duration::from_millis(3));
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.failures(), 0);
    }

    #[test]
    fn test_half_open_admits_one_trial() {
        let cb = breaker(1, 20);
        cb.record_failure(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(40));

        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(!cb.allow_request());
        assert!(!cb.allow_request());

        cb.record_success(Duration::from_millis(2));
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow_request());
        assert!(cb.allow_request());
    }

    #[test]
    fn test_abandoned_trial_frees_slot_after_cooldown() {
        let cb = breaker(1, 20);
        cb.record_failure(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(40));

        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cb.allow_request());
        assert_eq!(cb.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(5, 20);
        cb.force_open();
        std::thread::sleep(Duration::from_millis(40));

        assert!(cb.allow_request());
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_reset() {
        let cb = breaker(1, 60_000);
        cb.record_failure(Duration::ZERO);
        assert_eq!(cb.state(), BreakerState::Open);

        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_snapshot_statistics() {
        let cb = breaker(10, 60_000);
        for ms in [10, 20, 30, 40] {
            cb.record_success(Duration::from_millis(ms));
        }
        cb.record_failure(Duration::from_millis(100));

        let snap = cb.snapshot();
        assert_eq!(snap.total_requests, 5);
        assert_eq!(snap.total_successes, 4);
        assert_eq!(snap.total_failures, 1);
        assert!((snap.success_rate - 80.0).abs() < 1e-9);
        assert!((snap.avg_response_ms - 40.0).abs() < 1e-9);
        assert_eq!(snap.p95_response_ms, 100);
        assert!(snap.last_failure.is_some());
    }

    #[test]
    fn test_response_window_bounded() {
        let cb = CircuitBreaker::new(
            "b",
            BreakerConfig {
                response_window: 3,
                ..BreakerConfig::default()
            },
        );
        for ms in [1000, 1, 1, 1] {
            cb.record_success(Duration::from_millis(ms));
        }
        assert!((cb.snapshot().avg_response_ms - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_state_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&BreakerState::HalfOpen).unwrap(),
            "\"HALF_OPEN\""
        );
    }

    #[test]
    fn test_registry_shares_breakers() {
        let registry = BreakerRegistry::new();
        let config = BreakerConfig::new().with_failure_threshold(1);

        let a = registry.get_or_create("primary", &config);
        let b = registry.get_or_create("primary", &config);
        a.record_failure(Duration::ZERO);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("secondary").is_none());
    }

    #[test]
    fn test_concurrent_failures_not_lost() {
        let cb = Arc::new(breaker(1_000, 60_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        cb.record_failure(Duration::ZERO);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cb.failures(), 400);
        assert_eq!(cb.snapshot().total_failures, 400);
    }
}
