//! Retries with capped exponential backoff and full jitter.

use meshsim_core::config::RetryConfig;
use meshsim_core::{DependencyId, FailureReason};
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// What the owner should do with a failed internal request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Send a fresh request for the dependency after `delay` seconds.
    Retry { attempt: u32, delay: f64 },
    /// The retry budget is spent; fail with `MaxRetriesReached`.
    Exhausted,
    /// Not a failure this manager retries.
    NotHandled,
}

/// Counts sends per dependency and decides on retries.
#[derive(Debug)]
pub struct RetryManager {
    config: RetryConfig,
    sends: HashMap<DependencyId, u32>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            sends: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Number of sends recorded for `dependency`.
    pub fn sends(&self, dependency: DependencyId) -> u32 {
        self.sends.get(&dependency).copied().unwrap_or(0)
    }

    pub fn tracked(&self) -> usize {
        self.sends.len()
    }

    pub fn on_send(&mut self, dependency: DependencyId) -> u32 {
        let count = self.sends.entry(dependency).or_insert(0);
        *count += 1;
        *count
    }

    /// The answer for `dependency` arrived; its budget resets.
    pub fn on_result(&mut self, dependency: DependencyId) {
        self.sends.remove(&dependency);
    }

    pub fn forget(&mut self, dependency: DependencyId) {
        self.sends.remove(&dependency);
    }

    /// Uncapped-by-jitter backoff after `retries_done` retries.
    pub fn backoff(&self, retries_done: u32) -> f64 {
        let exponent = i32::try_from(retries_done).unwrap_or(i32::MAX);
        let delay = self.config.base_backoff * self.config.backoff_base.powi(exponent);
        delay.min(self.config.max_backoff)
    }

    pub fn on_failure<R: Rng + ?Sized>(
        &mut self,
        dependency: DependencyId,
        reason: FailureReason,
        rng: &mut R,
    ) -> RetryDecision {
        if reason == FailureReason::MaxRetriesReached {
            return RetryDecision::NotHandled;
        }
        let Some(&sends) = self.sends.get(&dependency) else {
            return RetryDecision::NotHandled;
        };

        let retries_done = sends.saturating_sub(1);
        if retries_done >= self.config.max_tries {
            self.sends.remove(&dependency);
            debug!(dependency = %dependency, retries = retries_done, "retry budget exhausted");
            return RetryDecision::Exhausted;
        }

        let mut delay = self.backoff(retries_done);
        if self.config.jitter && delay > 0.0 {
            delay = rng.gen_range(0.0..delay);
        }
        debug!(
            dependency = %dependency,
            attempt = retries_done + 1,
            delay,
            %reason,
            "scheduling retry"
        );
        RetryDecision::Retry {
            attempt: retries_done + 1,
            delay,
        }
    }

    pub fn shutdown(&mut self) {
        self.sends.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn manager(max_tries: u32, jitter: bool) -> RetryManager {
        RetryManager::new(RetryConfig {
            max_tries,
            base_backoff: 0.01,
            backoff_base: 3.0,
            max_backoff: 1.0,
            jitter,
        })
    }

    #[test]
    fn test_exactly_max_tries_retries() {
        let mut retry = manager(3, false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let dep = DependencyId(7);

        let mut retries = 0;
        retry.on_send(dep);
        loop {
            match retry.on_failure(dep, FailureReason::NoInstanceAvailable, &mut rng) {
                RetryDecision::Retry { attempt, .. } => {
                    retries += 1;
                    assert_eq!(attempt, retries);
                    retry.on_send(dep);
                }
                RetryDecision::Exhausted => break,
                RetryDecision::NotHandled => panic!("dependency should be tracked"),
            }
        }
        assert_eq!(retries, 3);
        assert_eq!(retry.sends(dep), 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = manager(10, false);
        assert!((retry.backoff(0) - 0.01).abs() < 1e-12);
        assert!((retry.backoff(1) - 0.03).abs() < 1e-12);
        assert!((retry.backoff(2) - 0.09).abs() < 1e-12);
        assert_eq!(retry.backoff(6), 1.0);
    }

    #[test]
    fn test_jittered_delay_within_bound() {
        let mut retry = manager(50, true);
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let dep = DependencyId(1);
        retry.on_send(dep);
        for retries_done in 0..20 {
            let bound = retry.backoff(retries_done);
            match retry.on_failure(dep, FailureReason::DependencyNotAvailable, &mut rng) {
                RetryDecision::Retry { delay, .. } => {
                    assert!(delay >= 0.0 && delay < bound, "{delay} not in [0, {bound})");
                }
                other => panic!("unexpected decision {other:?}"),
            }
            retry.on_send(dep);
        }
    }

    #[test]
    fn test_untracked_and_max_retries_not_handled() {
        let mut retry = manager(3, false);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(
            retry.on_failure(DependencyId(1), FailureReason::CircuitOpen, &mut rng),
            RetryDecision::NotHandled
        );
        retry.on_send(DependencyId(1));
        assert_eq!(
            retry.on_failure(DependencyId(1), FailureReason::MaxRetriesReached, &mut rng),
            RetryDecision::NotHandled
        );
    }

    #[test]
    fn test_result_clears_counter() {
        let mut retry = manager(3, false);
        retry.on_send(DependencyId(1));
        retry.on_send(DependencyId(1));
        assert_eq!(retry.sends(DependencyId(1)), 2);
        retry.on_result(DependencyId(1));
        assert_eq!(retry.tracked(), 0);
    }
}
