//! Per-key circuit breakers. Every transition takes an explicit `now` so
//! the state machine can be driven deterministically.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::domain::recovery::{BreakerState, CircuitBreaker};

/// What the breaker allows for one arriving error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerDecision {
    Allowed,
    /// Half-open: this request is the single trial request.
    Trial,
    Rejected,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, threshold: u32, cooldown_ms: u64) -> Self {
        Self {
            key: key.into(),
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            threshold: threshold.max(1),
            cooldown_ms,
            trial_in_flight: false,
        }
    }

    pub fn allow_request_at(&mut self, now: DateTime<Utc>) -> BreakerDecision {
        match self.state {
            BreakerState::Closed => BreakerDecision::Allowed,
            BreakerState::Open => {
                let reopens_at = self
                    .opened_at
                    .map(|opened| opened + Duration::milliseconds(self.cooldown_ms as i64));
                if reopens_at.is_some_and(|at| now >= at) {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    BreakerDecision::Trial
                } else {
                    BreakerDecision::Rejected
                }
            }
            BreakerState::HalfOpen if self.trial_in_flight => BreakerDecision::Rejected,
            BreakerState::HalfOpen => {
                self.trial_in_flight = true;
                BreakerDecision::Trial
            }
        }
    }

    pub fn record_failure_at(&mut self, now: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
        match self.state {
            BreakerState::Closed if self.failure_count >= self.threshold => self.open_at(now),
            BreakerState::HalfOpen => self.open_at(now),
            BreakerState::Closed | BreakerState::Open => {}
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    fn open_at(&mut self, now: DateTime<Utc>) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}

/// Breakers keyed by agent id (or `"global"`), created on first use.
#[derive(Debug)]
pub(crate) struct BreakerRegistry {
    breakers: BTreeMap<String, CircuitBreaker>,
    threshold: u32,
    cooldown_ms: u64,
}

impl BreakerRegistry {
    pub(crate) fn new(threshold: u32, cooldown_ms: u64) -> Self {
        Self { breakers: BTreeMap::new(), threshold, cooldown_ms }
    }

    fn entry(&mut self, key: &str) -> &mut CircuitBreaker {
        let (threshold, cooldown_ms) = (self.threshold, self.cooldown_ms);
        self.breakers
            .entry(key.to_owned())
            .or_insert_with(|| CircuitBreaker::new(key, threshold, cooldown_ms))
    }

    pub(crate) fn allow_request_at(&mut self, key: &str, now: DateTime<Utc>) -> BreakerDecision {
        let breaker = self.entry(key);
        let before = breaker.state;
        let decision = breaker.allow_request_at(now);
        if before != breaker.state {
            info!(
                event_name = "recovery.breaker.half_open",
                breaker = key,
                "circuit breaker cooled down; allowing one trial request"
            );
        }
        decision
    }

    pub(crate) fn record_failure_at(&mut self, key: &str, now: DateTime<Utc>) {
        let breaker = self.entry(key);
        let before = breaker.state;
        breaker.record_failure_at(now);
        if before != BreakerState::Open && breaker.state == BreakerState::Open {
            warn!(
                event_name = "recovery.breaker.opened",
                breaker = key,
                failures = breaker.failure_count,
                "circuit breaker opened"
            );
        }
    }

    pub(crate) fn record_success(&mut self, key: &str) {
        let cooldown_ms = self.cooldown_ms;
        let breaker = self.entry(key);
        if breaker.state != BreakerState::Closed {
            info!(event_name = "recovery.breaker.closed", breaker = key, "circuit breaker closed");
        }
        breaker.record_success();
        breaker.cooldown_ms = cooldown_ms;
    }

    /// Zeroes the consecutive-failure count of a closed breaker. Open and
    /// half-open breakers keep waiting for their trial request.
    pub(crate) fn clear_failures(&mut self, key: &str) {
        if let Some(breaker) = self.breakers.get_mut(key) {
            if breaker.state == BreakerState::Closed && breaker.failure_count > 0 {
                debug!(
                    event_name = "recovery.breaker.reset",
                    breaker = key,
                    failures = breaker.failure_count,
                    "failure streak broken by a success"
                );
                breaker.failure_count = 0;
            }
        }
    }

    /// Gives back a trial that could not run; the next arrival takes it instead.
    pub(crate) fn release_trial(&mut self, key: &str) {
        let breaker = self.entry(key);
        if breaker.state == BreakerState::HalfOpen {
            breaker.trial_in_flight = false;
        }
    }

    /// Opens `key` for `duration_ms`, regardless of its failure count. The
    /// configured cooldown applies again once the breaker closes.
    pub(crate) fn force_open_at(&mut self, key: &str, duration_ms: u64, now: DateTime<Utc>) {
        let breaker = self.entry(key);
        breaker.cooldown_ms = duration_ms;
        breaker.open_at(now);
        warn!(
            event_name = "recovery.breaker.forced_open",
            breaker = key,
            duration_ms,
            "circuit breaker forced open"
        );
    }

    pub(crate) fn get(&self, key: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(key)
    }

    pub(crate) fn snapshot(&self) -> Vec<CircuitBreaker> {
        self.breakers.values().cloned().collect()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.breakers.values().filter(|breaker| breaker.state == BreakerState::Open).count()
    }
}
