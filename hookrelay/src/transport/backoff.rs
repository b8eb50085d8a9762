//! Reconnect delays: exponential with bounded jitter, reset after a stable window.
//!
//! Jittered delays never exceed the cap and never drop below the previous
//! delay, so the sequence only grows until it is reset.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
    /// Fraction of the nominal delay the actual delay may deviate by.
    pub jitter: f64,
    /// A socket open at least this long resets the sequence.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 2,
            max: Duration::from_secs(30),
            jitter: 0.2,
            reset_after: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the `failures`-th reconnect, without jitter.
    pub fn nominal(&self, failures: u32) -> Duration {
        let multiplier = self.factor.checked_pow(failures).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(multiplier)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    last_delay: Duration,
    opened_at: Option<Instant>,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    pub fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            failures: 0,
            last_delay: Duration::ZERO,
            opened_at: None,
            rng,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Consecutive reconnects since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn at_ceiling(&self) -> bool {
        self.policy.nominal(self.failures) >= self.policy.max
    }

    /// Next delay to wait, advancing the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.policy.nominal(self.failures);
        self.failures = self.failures.saturating_add(1);
        let jittered = if self.policy.jitter > 0.0 {
            let spread = self.rng.gen_range(-self.policy.jitter..=self.policy.jitter);
            nominal.mul_f64(1.0 + spread)
        } else {
            nominal
        };
        let delay = jittered.min(self.policy.max).max(self.last_delay);
        self.last_delay = delay;
        delay
    }

    pub fn on_open(&mut self, now: Instant) {
        self.opened_at = Some(now);
    }

    pub fn on_close(&mut self, now: Instant) {
        if let Some(opened_at) = self.opened_at.take() {
            if now.saturating_duration_since(opened_at) >= self.policy.reset_after {
                self.reset();
            }
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.last_delay = Duration::ZERO;
    }
}
