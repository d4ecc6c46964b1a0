//! Backoff policy for broken realtime channels
//!
//! Pure decision logic: no timers, no I/O. The only non-determinism is the
//! jitter source, which callers can replace.

use claimsync_core::{ReconnectionPolicy, ReconnectionState};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Source of jitter samples in `[0.0, 1.0)`
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// Thread-local RNG jitter
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Constant jitter (for tests and deterministic replays)
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Whether and when to try again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub delay: Duration,
    pub should_retry: bool,
}

/// Exponential backoff with jitter and an attempt ceiling
#[derive(Clone)]
pub struct ReconnectionStrategy {
    policy: ReconnectionPolicy,
    jitter: Arc<dyn JitterSource>,
}

impl ReconnectionStrategy {
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self::with_jitter(policy, Arc::new(RandomJitter))
    }

    pub fn with_jitter(policy: ReconnectionPolicy, jitter: Arc<dyn JitterSource>) -> Self {
        Self { policy, jitter }
    }

    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.policy
    }

    /// Decide the next retry after `state.attempt_count` failures
    ///
    /// Retries are allowed while `attempt_count <= max_attempts`; past the
    /// ceiling the answer stays "no" until the caller resets the state.
    pub fn next_attempt(&self, state: &ReconnectionState) -> RetryDecision {
        if state.attempt_count > self.policy.max_attempts {
            return RetryDecision {
                delay: Duration::ZERO,
                should_retry: false,
            };
        }

        let max_ms = self.policy.max_delay_ms;
        let exponent = state.attempt_count.saturating_sub(1).min(30);
        let backoff_ms = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(max_ms);

        let ratio = self.policy.jitter_ratio.clamp(0.0, 1.0);
        let sample = self.jitter.sample().clamp(0.0, 1.0);
        let jitter_ms = (backoff_ms as f64 * ratio * sample) as u64;

        RetryDecision {
            delay: Duration::from_millis(backoff_ms.saturating_add(jitter_ms).min(max_ms)),
            should_retry: true,
        }
    }
}

impl Default for ReconnectionStrategy {
    fn default() -> Self {
        Self::new(ReconnectionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(attempts: u32) -> ReconnectionState {
        ReconnectionState {
            attempt_count: attempts,
            ..Default::default()
        }
    }

    fn strategy(jitter: f64) -> ReconnectionStrategy {
        ReconnectionStrategy::with_jitter(ReconnectionPolicy::default(), Arc::new(FixedJitter(jitter)))
    }

    #[test]
    fn test_exponential_backoff() {
        let s = strategy(0.0);
        let delays: Vec<u64> = (1..=5)
            .map(|n| s.next_attempt(&state(n)).delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
    }

    #[test]
    fn test_delay_is_capped() {
        let s = ReconnectionStrategy::with_jitter(
            ReconnectionPolicy {
                max_attempts: 100,
                ..Default::default()
            },
            Arc::new(FixedJitter(0.9)),
        );
        assert_eq!(s.next_attempt(&state(40)).delay, Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_is_added() {
        let s = strategy(0.5);
        // 2s base, 20% ratio, half the range
        assert_eq!(s.next_attempt(&state(2)).delay, Duration::from_millis(2_200));
    }

    #[test]
    fn test_gives_up_past_ceiling() {
        let s = strategy(0.0);
        assert!(s.next_attempt(&state(5)).should_retry);
        let decision = s.next_attempt(&state(6));
        assert!(!decision.should_retry);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn test_same_inputs_same_answer() {
        let s = strategy(0.3);
        assert_eq!(s.next_attempt(&state(3)), s.next_attempt(&state(3)));
    }
}
