//! Retry delay computation shared by step retries, job retries and recovery
//! re-enqueues.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// Delay policy between attempts.
///
/// `attempt` arguments are zero-based retry indices: the delay before the
/// first retry is `delay_for(0)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            initial_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            initial_delay_ms: delay_ms,
            multiplier: 1.0,
            max_delay_ms: delay_ms,
            jitter: false,
        }
    }

    pub fn exponential(initial_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms,
            multiplier,
            max_delay_ms,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry at `attempt`, jitter applied, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms_for(attempt))
    }

    pub fn delay_ms_for(&self, attempt: u32) -> u64 {
        let base = self.base_delay_ms(attempt);
        if !self.jitter || base == 0 {
            return base;
        }

        // Jitter span never exceeds the growth factor so exponential delays
        // stay non-decreasing.
        let span = match self.strategy {
            BackoffStrategy::Exponential => (self.multiplier - 1.0).clamp(0.0, 0.25),
            BackoffStrategy::Fixed | BackoffStrategy::Linear => 0.25,
        };
        let factor = if span > 0.0 { 1.0 + rand::thread_rng().gen_range(0.0..span) } else { 1.0 };
        let jittered = (base as f64 * factor).round() as u64;
        jittered.min(self.cap_ms())
    }

    /// Delay before the retry at `attempt` without jitter, capped.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let initial = self.initial_delay_ms;
        let raw = match self.strategy {
            BackoffStrategy::Fixed => initial as f64,
            BackoffStrategy::Linear => initial as f64 * f64::from(attempt.saturating_add(1)),
            BackoffStrategy::Exponential => {
                let multiplier = if self.multiplier < 1.0 { 1.0 } else { self.multiplier };
                initial as f64 * multiplier.powi(attempt.min(32) as i32)
            }
        };

        let capped = raw.min(self.cap_ms() as f64);
        if capped.is_finite() && capped > 0.0 {
            capped.round() as u64
        } else {
            0
        }
    }

    fn cap_ms(&self) -> u64 {
        self.max_delay_ms.max(self.initial_delay_ms)
    }
}
