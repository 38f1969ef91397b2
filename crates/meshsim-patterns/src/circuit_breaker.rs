//! Count-based circuit breaker.
//!
//! ```text
//!   CLOSED ──error rate ≥ threshold──► OPEN ──sleep window──► HALF_OPEN
//!     ▲                                 ▲                        │
//!     └────────── one success ──────────┼──── one failure ───────┘
//! ```

use meshsim_core::config::CircuitBreakerConfig;
use meshsim_core::{DependencyId, EventId, FailureReason, ServiceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerStatus {
    /// Numeric encoding used in reported series.
    pub fn level(&self) -> f64 {
        match self {
            BreakerStatus::Closed => 0.0,
            BreakerStatus::HalfOpen => 1.0,
            BreakerStatus::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerStatus::Closed => "CLOSED",
            BreakerStatus::HalfOpen => "HALF_OPEN",
            BreakerStatus::Open => "OPEN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub status: BreakerStatus,
    pub successes: u64,
    pub failures: u64,
    pub error_rate: f64,
}

/// Request to schedule the half-open transition of the breaker towards `target`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use]
pub struct HalfOpenArm {
    pub target: ServiceId,
    pub after: f64,
}

/// Breaker state for one monitored target.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    status: BreakerStatus,
    /// Most recent outcomes, `true` for success. Never longer than `capacity`.
    window: VecDeque<bool>,
    capacity: usize,
    /// Error rate in [0, 1] at which the breaker opens.
    threshold: f64,
    sleep_window: f64,
    successes: u64,
    failures: u64,
    /// Pending half-open transition, if armed.
    half_open_timer: Option<EventId>,
    /// An opening asked for a timer the owner has not reported back yet.
    arm_requested: bool,
}

impl CircuitBreakerState {
    /// `capacity` is raised to at least one.
    pub fn new(capacity: usize, threshold: f64, sleep_window: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            status: BreakerStatus::Closed,
            window: VecDeque::with_capacity(capacity),
            capacity,
            threshold,
            sleep_window,
            successes: 0,
            failures: 0,
            half_open_timer: None,
            arm_requested: false,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            config.rolling_window,
            config.error_threshold_fraction(),
            config.sleep_window,
        )
    }

    pub fn status(&self) -> BreakerStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == BreakerStatus::Open
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Failure share of a full window; zero until the window is full.
    pub fn error_rate(&self) -> f64 {
        if self.window.len() < self.capacity {
            return 0.0;
        }
        let failed = self.window.iter().filter(|ok| !**ok).count();
        failed as f64 / self.window.len() as f64
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            status: self.status,
            successes: self.successes,
            failures: self.failures,
            error_rate: self.error_rate(),
        }
    }

    /// Returns the sleep window when a half-open timer must be armed.
    pub fn record_success(&mut self) -> Option<f64> {
        self.successes += 1;
        if self.status == BreakerStatus::HalfOpen {
            self.status = BreakerStatus::Closed;
            self.window.clear();
            return None;
        }
        self.push(true);
        self.check_error_rate()
    }

    /// Returns the sleep window when a half-open timer must be armed.
    pub fn record_failure(&mut self) -> Option<f64> {
        self.failures += 1;
        if self.status == BreakerStatus::HalfOpen {
            return self.open();
        }
        self.push(false);
        self.check_error_rate()
    }

    fn push(&mut self, success: bool) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    fn check_error_rate(&mut self) -> Option<f64> {
        if self.window.len() == self.capacity && self.error_rate() >= self.threshold {
            self.open()
        } else {
            None
        }
    }

    fn open(&mut self) -> Option<f64> {
        self.status = BreakerStatus::Open;
        self.window.clear();
        if self.half_open_timer.is_some() || self.arm_requested {
            return None;
        }
        self.arm_requested = true;
        Some(self.sleep_window)
    }

    pub fn set_half_open_timer(&mut self, event: EventId) {
        self.arm_requested = false;
        self.half_open_timer = Some(event);
    }

    pub fn take_half_open_timer(&mut self) -> Option<EventId> {
        self.arm_requested = false;
        self.half_open_timer.take()
    }

    /// Fired by the half-open timer.
    pub fn to_half_open(&mut self) {
        self.half_open_timer = None;
        self.arm_requested = false;
        self.status = BreakerStatus::HalfOpen;
    }
}

/// Outcome of a send observed by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendVerdict {
    Proceed,
    /// The breaker consumed the send; it fails with the given reason.
    Reject(FailureReason),
}

/// All breakers of one instance, one state per target service.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: BTreeMap<ServiceId, CircuitBreakerState>,
    /// Dependencies with an in-flight request and the service they target.
    active: HashMap<DependencyId, ServiceId>,
    active_per_target: HashMap<ServiceId, u32>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
            active: HashMap::new(),
            active_per_target: HashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self, target: ServiceId) -> Option<&CircuitBreakerState> {
        self.states.get(&target)
    }

    pub fn active_connections(&self, target: ServiceId) -> u32 {
        self.active_per_target.get(&target).copied().unwrap_or(0)
    }

    fn state_mut(&mut self, target: ServiceId) -> &mut CircuitBreakerState {
        let config = &self.config;
        self.states
            .entry(target)
            .or_insert_with(|| CircuitBreakerState::from_config(config))
    }

    /// Observe an internal request about to be sent for `dependency`.
    pub fn on_send(
        &mut self,
        dependency: DependencyId,
        target: ServiceId,
    ) -> (SendVerdict, Option<HalfOpenArm>) {
        if self.state_mut(target).is_open() {
            debug!(dependency = %dependency, target = %target, "circuit open, rejecting send");
            return (SendVerdict::Reject(FailureReason::CircuitOpen), None);
        }

        if self.active.insert(dependency, target).is_none() {
            *self.active_per_target.entry(target).or_insert(0) += 1;
        }
        let connections = self.active_connections(target);
        let limit = self.config.request_volume_threshold.unwrap_or(u32::MAX);
        if connections > limit {
            self.release(dependency);
            let arm = self.record(target, false);
            debug!(
                dependency = %dependency,
                target = %target,
                connections,
                limit,
                "connection volume limit reached"
            );
            return (
                SendVerdict::Reject(FailureReason::VolumeThresholdReached),
                arm,
            );
        }
        (SendVerdict::Proceed, None)
    }

    /// The answer for `dependency` reached this instance.
    pub fn on_result(&mut self, dependency: DependencyId) -> Option<HalfOpenArm> {
        let target = self.release(dependency)?;
        self.record(target, true)
    }

    /// The request for `dependency` failed. Only active connections count.
    pub fn on_failed(&mut self, dependency: DependencyId) -> Option<HalfOpenArm> {
        let target = self.release(dependency)?;
        self.record(target, false)
    }

    /// Stop tracking `dependency` without recording an outcome.
    pub fn forget(&mut self, dependency: DependencyId) {
        self.release(dependency);
    }

    pub fn set_half_open_timer(&mut self, target: ServiceId, event: EventId) {
        self.state_mut(target).set_half_open_timer(event);
    }

    pub fn to_half_open(&mut self, target: ServiceId) {
        if let Some(state) = self.states.get_mut(&target) {
            state.to_half_open();
            info!(target = %target, "circuit half-open");
        }
    }

    /// Forget all state. Returns the pending timers the owner must cancel.
    pub fn shutdown(&mut self) -> Vec<EventId> {
        let timers = self
            .states
            .values_mut()
            .filter_map(|s| s.take_half_open_timer())
            .collect();
        self.states.clear();
        self.active.clear();
        self.active_per_target.clear();
        timers
    }

    pub fn stats(&self) -> impl Iterator<Item = (ServiceId, BreakerStats)> + '_ {
        self.states.iter().map(|(target, state)| (*target, state.stats()))
    }

    fn release(&mut self, dependency: DependencyId) -> Option<ServiceId> {
        let target = self.active.remove(&dependency)?;
        if let Some(count) = self.active_per_target.get_mut(&target) {
            *count = count.saturating_sub(1);
        }
        Some(target)
    }

    fn record(&mut self, target: ServiceId, success: bool) -> Option<HalfOpenArm> {
        let state = self.state_mut(target);
        let before = state.status();
        let arm = if success {
            state.record_success()
        } else {
            state.record_failure()
        };
        let after = state.status();
        if before != after {
            info!(target = %target, from = %before, to = %after, "circuit breaker transition");
        }
        arm.map(|after| HalfOpenArm { target, after })
    }
}
