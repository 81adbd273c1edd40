//! Process-wide circuit breaker guarding the reasoning and sandbox calls.
//!
//! One breaker is shared by every orchestrator in the process. It keeps a
//! sliding window of the most recent call outcomes and refuses calls while
//! the failure rate over that window is at or above the configured
//! threshold.
//!
//! ```text
//! Closed --(rate >= threshold, window >= minimum)--> Open
//! Open   --(open_duration elapsed, next allow_request)--> HalfOpen
//! HalfOpen --(probe succeeds)--> Closed
//! HalfOpen --(probe fails)-----> Open
//! ```
//!
//! Callers that make the guarded call take a [`BreakerPermit`] from
//! [`CircuitBreaker::admit`]. A permit dropped without an outcome, because
//! the call was cancelled or timed out, hands its half-open probe slot back.
//!
//! Time comes from an injected [`Clock`] so tests can move it by hand.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use events::{Event, EventBus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Share of the failure threshold at which the breaker reports a warning.
const WARNING_RATIO: f64 = 0.7;

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Normal,
    Warning,
    Critical,
}

/// Point-in-time view of the breaker. `failure_rate` is a fraction in `[0, 1]`
/// over the current window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub state: BreakerState,
    pub is_open: bool,
    pub failure_count: usize,
    pub success_count: usize,
    pub total_calls: usize,
    pub failure_rate: f64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_requests: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatistics {
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_opens: u64,
    pub average_duration_ms: f64,
    pub uptime_percentage: f64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    window: VecDeque<bool>,
    failures_in_window: usize,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    last_activity: Instant,
    /// Start of the period uptime is measured over.
    since: Instant,
    half_open_requests: u32,
    /// Bumped on every entry into HalfOpen so stale permits can be told apart.
    half_open_epoch: u64,
    total_calls: u64,
    total_failures: u64,
    total_opens: u64,
    total_duration_ms: u64,
    time_open: Duration,
}

impl Inner {
    fn new(now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            window: VecDeque::new(),
            failures_in_window: 0,
            opened_at: None,
            opened_at_wall: None,
            last_failure_time: None,
            last_success_time: None,
            last_activity: now,
            since: now,
            half_open_requests: 0,
            half_open_epoch: 0,
            total_calls: 0,
            total_failures: 0,
            total_opens: 0,
            total_duration_ms: 0,
            time_open: Duration::ZERO,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.failures_in_window as f64 / self.window.len() as f64
        }
    }

    fn clear_window(&mut self) {
        self.window.clear();
        self.failures_in_window = 0;
    }

    fn push(&mut self, success: bool, capacity: usize) {
        self.window.push_back(success);
        if !success {
            self.failures_in_window += 1;
        }
        while self.window.len() > capacity {
            if let Some(false) = self.window.pop_front() {
                self.failures_in_window -= 1;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.opened_at_wall = Some(Utc::now());
        self.half_open_requests = 0;
        self.total_opens += 1;
    }

    fn leave_open(&mut self, now: Instant) {
        if let Some(opened_at) = self.opened_at {
            self.time_open += now.saturating_duration_since(opened_at);
        }
    }
}

struct Transition {
    from: BreakerState,
    to: BreakerState,
    reason: String,
}

/// One admitted call. Settle it with [`record`](Self::record); dropping it
/// unsettled releases the half-open probe slot it holds, if any.
#[must_use = "dropping a permit abandons the call"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe_epoch: Option<u64>,
}

impl BreakerPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe_epoch.is_some()
    }

    pub fn record(mut self, success: bool, duration_ms: u64) {
        self.probe_epoch = None;
        self.breaker.record_call(success, duration_ms);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.probe_epoch.take() {
            self.breaker.release_probe(epoch);
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    event_bus: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            inner: Mutex::new(Inner::new(now)),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits or refuses one call. Moves Open to HalfOpen once the cooldown
    /// has elapsed; that call is the first probe.
    ///
    /// A half-open slot taken here stays taken until [`record_call`](Self::record_call)
    /// resolves the breaker; prefer [`admit`](Self::admit) when the call can
    /// be abandoned.
    pub fn allow_request(&self) -> bool {
        self.try_admit().is_some()
    }

    /// Like [`allow_request`](Self::allow_request), returning a permit that
    /// gives its probe slot back if dropped before an outcome is recorded.
    pub fn admit(&self) -> Option<BreakerPermit<'_>> {
        self.try_admit().map(|probe_epoch| BreakerPermit {
            breaker: self,
            probe_epoch,
        })
    }

    /// `None` when refused, `Some(Some(epoch))` for a half-open probe.
    fn try_admit(&self) -> Option<Option<u64>> {
        let now = self.clock.now();
        let mut transition = None;

        let admitted = {
            let mut inner = self.lock();
            self.forget_if_idle(&mut inner, now);
            match inner.state {
                BreakerState::Closed => Some(None),
                BreakerState::Open => {
                    if self.cooldown_elapsed(&inner, now) {
                        inner.leave_open(now);
                        inner.state = BreakerState::HalfOpen;
                        inner.half_open_requests = 1;
                        inner.half_open_epoch += 1;
                        transition = Some(Transition {
                            from: BreakerState::Open,
                            to: BreakerState::HalfOpen,
                            reason: "open duration elapsed".to_string(),
                        });
                        Some(Some(inner.half_open_epoch))
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => {
                    if inner.half_open_requests < self.config.half_open_max_calls {
                        inner.half_open_requests += 1;
                        Some(Some(inner.half_open_epoch))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }
        if admitted.is_none() {
            debug!("Circuit breaker refused request");
        }
        admitted
    }

    /// Returns an abandoned probe slot, unless the breaker has left the
    /// half-open period the probe was admitted in.
    fn release_probe(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen
            && inner.half_open_epoch == epoch
            && inner.half_open_requests > 0
        {
            inner.half_open_requests -= 1;
            debug!(
                in_flight = inner.half_open_requests,
                "Abandoned half-open probe released"
            );
        }
    }

    /// Same answer as [`allow_request`](Self::allow_request) without taking a
    /// probe slot or changing state.
    pub fn would_allow(&self) -> bool {
        let now = self.clock.now();
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => self.cooldown_elapsed(&inner, now),
            BreakerState::HalfOpen => inner.half_open_requests < self.config.half_open_max_calls,
        }
    }

    pub fn record_call(&self, success: bool, duration_ms: u64) {
        let now = self.clock.now();

        let transition = {
            let mut inner = self.lock();
            self.forget_if_idle(&mut inner, now);

            inner.last_activity = now;
            inner.total_calls += 1;
            inner.total_duration_ms += duration_ms;
            if success {
                inner.last_success_time = Some(Utc::now());
            } else {
                inner.total_failures += 1;
                inner.last_failure_time = Some(Utc::now());
            }
            inner.push(success, self.config.sliding_window_size);

            match inner.state {
                BreakerState::HalfOpen if success => {
                    inner.state = BreakerState::Closed;
                    inner.half_open_requests = 0;
                    inner.opened_at = None;
                    inner.opened_at_wall = None;
                    inner.clear_window();
                    Some(Transition {
                        from: BreakerState::HalfOpen,
                        to: BreakerState::Closed,
                        reason: "probe succeeded".to_string(),
                    })
                }
                BreakerState::HalfOpen => {
                    inner.open(now);
                    Some(Transition {
                        from: BreakerState::HalfOpen,
                        to: BreakerState::Open,
                        reason: "probe failed".to_string(),
                    })
                }
                BreakerState::Closed => {
                    let rate = inner.failure_rate();
                    if inner.window.len() >= self.config.minimum_requests
                        && rate * 100.0 >= self.config.failure_threshold
                    {
                        inner.open(now);
                        Some(Transition {
                            from: BreakerState::Closed,
                            to: BreakerState::Open,
                            reason: format!("failure rate {:.1}%", rate * 100.0),
                        })
                    } else {
                        None
                    }
                }
                BreakerState::Open => None,
            }
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    /// Forces the breaker open, e.g. when an operator takes a dependency down.
    pub fn open(&self, reason: &str) {
        let now = self.clock.now();
        let from = {
            let mut inner = self.lock();
            let from = inner.state;
            if from == BreakerState::Open {
                return;
            }
            inner.open(now);
            from
        };
        self.announce(Transition {
            from,
            to: BreakerState::Open,
            reason: reason.to_string(),
        });
    }

    /// Zeroes every counter, open time included, and forces the breaker
    /// closed. Uptime is measured from the reset onwards.
    pub fn reset(&self) {
        let now = self.clock.now();
        let from = {
            let mut inner = self.lock();
            let from = inner.state;
            let epoch = inner.half_open_epoch;
            *inner = Inner::new(now);
            inner.half_open_epoch = epoch;
            from
        };
        if from != BreakerState::Closed {
            self.announce(Transition {
                from,
                to: BreakerState::Closed,
                reason: "manual reset".to_string(),
            });
        }
    }

    pub fn close(&self) {
        self.reset();
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            state: inner.state,
            is_open: inner.state == BreakerState::Open,
            failure_count: inner.failures_in_window,
            success_count: inner.window.len() - inner.failures_in_window,
            total_calls: inner.window.len(),
            failure_rate: inner.failure_rate(),
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            opened_at: inner.opened_at_wall,
            half_open_requests: inner.half_open_requests,
        }
    }

    pub fn statistics(&self) -> BreakerStatistics {
        let now = self.clock.now();
        let inner = self.lock();

        let mut time_open = inner.time_open;
        if let (BreakerState::Open, Some(opened_at)) = (inner.state, inner.opened_at) {
            time_open += now.saturating_duration_since(opened_at);
        }
        let lifetime = now.saturating_duration_since(inner.since);
        let uptime_percentage = if lifetime.is_zero() {
            100.0
        } else {
            (1.0 - time_open.as_secs_f64() / lifetime.as_secs_f64()).max(0.0) * 100.0
        };

        BreakerStatistics {
            total_calls: inner.total_calls,
            total_successes: inner.total_calls - inner.total_failures,
            total_failures: inner.total_failures,
            total_opens: inner.total_opens,
            average_duration_ms: if inner.total_calls == 0 {
                0.0
            } else {
                inner.total_duration_ms as f64 / inner.total_calls as f64
            },
            uptime_percentage,
        }
    }

    pub fn degradation_level(&self) -> DegradationLevel {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open => DegradationLevel::Critical,
            BreakerState::HalfOpen => DegradationLevel::Warning,
            BreakerState::Closed
                if inner.window.len() >= self.config.minimum_requests
                    && inner.failure_rate() * 100.0
                        >= self.config.failure_threshold * WARNING_RATIO =>
            {
                DegradationLevel::Warning
            }
            BreakerState::Closed => DegradationLevel::Normal,
        }
    }

    fn cooldown_elapsed(&self, inner: &Inner, now: Instant) -> bool {
        inner
            .opened_at
            .map(|opened_at| now.saturating_duration_since(opened_at) >= self.config.open_duration())
            .unwrap_or(true)
    }

    fn forget_if_idle(&self, inner: &mut Inner, now: Instant) {
        if inner.state == BreakerState::Closed
            && !inner.window.is_empty()
            && now.saturating_duration_since(inner.last_activity) >= self.config.reset_timeout()
        {
            debug!("Circuit breaker window expired after inactivity");
            inner.clear_window();
        }
    }

    fn announce(&self, transition: Transition) {
        match transition.to {
            BreakerState::Open => warn!(
                from = %transition.from,
                reason = %transition.reason,
                "Circuit breaker opened"
            ),
            _ => info!(
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "Circuit breaker state changed"
            ),
        }

        if let Some(ref bus) = self.event_bus {
            bus.emit(Event::BreakerStateChanged {
                from_state: transition.from.as_str().to_string(),
                to_state: transition.to.as_str().to_string(),
                reason: transition.reason,
            });
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("CircuitBreaker")
            .field("state", &snapshot.state)
            .field("total_calls", &snapshot.total_calls)
            .field("failure_rate", &snapshot.failure_rate)
            .finish()
    }
}
