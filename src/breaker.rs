//! Per-dependency circuit breakers with a process-wide registry.
//!
//! Each isolated external dependency (the remote file transport, each
//! health-probe target) gets its own breaker keyed by an arbitrary string,
//! so one failing dependency cannot consume worker capacity meant for the
//! others.
//!
//! States:
//! - `Closed` — normal operation, failures counted;
//! - `Open` — fast-reject, no call attempted, until the recovery timeout
//!   elapses;
//! - `HalfOpen` — a bounded number of probe calls allowed through; a probe
//!   success closes the circuit, a probe failure re-opens it with a fresh
//!   timer.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BreakerConfig;

/// Circuit state.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls permitted; failures counted.
    Closed,
    /// Calls fast-rejected until the recovery timeout elapses.
    Open,
    /// Limited probe calls permitted.
    HalfOpen,
}

/// Telemetry snapshot of one breaker.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failure count.
    pub failure_count: u32,
    /// Configured failure threshold.
    pub failure_threshold: u32,
    /// Configured recovery timeout in seconds.
    pub recovery_timeout_seconds: u64,
    /// Seconds until an open circuit transitions to half-open; 0 otherwise.
    pub seconds_until_half_open: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure_time: Option<Instant>,
}

/// Per-key circuit breaker with configurable thresholds.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Construct a closed breaker with the given thresholds.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Construct a breaker from process-wide defaults.
    #[must_use]
    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(
            config.failure_threshold,
            Duration::from_secs(config.recovery_timeout_seconds),
            config.half_open_max_calls,
        )
    }

    /// Current state, auto-transitioning `Open` → `HalfOpen` when the
    /// recovery timeout has elapsed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Whether a call should be attempted.
    ///
    /// Side-effecting: in `HalfOpen`, a `true` return consumes one probe
    /// slot. Returns `false` while the circuit is open.
    #[must_use]
    pub fn is_call_permitted(&self) -> bool {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Record a successful call: resets the failure count and closes the
    /// circuit if a half-open probe succeeded.
    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!("circuit half-open -> closed (probe succeeded)");
            inner.state = CircuitState::Closed;
        }
        inner.failure_count = 0;
        inner.success_count += 1;
        inner.half_open_calls = 0;
    }

    /// Record a failed call: opens the circuit when the threshold is
    /// reached, and re-opens it immediately on a failed half-open probe.
    pub fn record_failure(&self) {
        let mut inner = self.lock_inner();
        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        if inner.state == CircuitState::HalfOpen {
            tracing::warn!(
                failure_count = inner.failure_count,
                "circuit half-open -> open (probe failed)"
            );
            inner.state = CircuitState::Open;
            inner.half_open_calls = 0;
        } else if inner.failure_count >= self.failure_threshold {
            if inner.state != CircuitState::Open {
                tracing::warn!(
                    failure_count = inner.failure_count,
                    failure_threshold = self.failure_threshold,
                    "circuit closed -> open"
                );
            }
            inner.state = CircuitState::Open;
            inner.half_open_calls = 0;
        }
    }

    /// Manually reset to closed (operator intervention).
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        inner.last_failure_time = None;
    }

    /// Telemetry snapshot for health endpoints.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        let seconds_until_half_open = match (inner.state, inner.last_failure_time) {
            (CircuitState::Open, Some(at)) => {
                self.recovery_timeout.saturating_sub(at.elapsed()).as_secs()
            }
            _ => 0,
        };
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout_seconds: self.recovery_timeout.as_secs(),
            seconds_until_half_open,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called with the inner lock held.
    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(at) = inner.last_failure_time {
                if at.elapsed() >= self.recovery_timeout {
                    tracing::info!("circuit open -> half-open (recovery timeout elapsed)");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_calls = 0;
                }
            }
        }
    }
}

/// Registry mapping dependency keys to lazily created breakers.
///
/// Constructed once at startup and injected wherever fault isolation is
/// needed; torn down with the process. The map is guarded by its own
/// mutex, independent of any session lock.
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    breakers: Mutex<HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Construct an empty registry with the given defaults.
    #[must_use]
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or lazily create the breaker for a dependency key.
    #[must_use]
    pub fn get(&self, key: &str) -> std::sync::Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::sync::Arc::clone(
            breakers
                .entry(key.to_owned())
                .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::from_config(&self.defaults))),
        )
    }

    /// Reset a breaker by key. Returns `false` if the key has never been used.
    pub fn reset(&self, key: &str) -> bool {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        breakers.get(key).map_or(false, |breaker| {
            breaker.reset();
            true
        })
    }

    /// Snapshot every breaker for telemetry.
    #[must_use]
    pub fn snapshot_all(&self) -> HashMap<String, BreakerSnapshot> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .iter()
            .map(|(key, breaker)| (key.clone(), breaker.snapshot()))
            .collect()
    }
}
