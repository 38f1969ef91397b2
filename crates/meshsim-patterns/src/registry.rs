//! Builds an instance's patterns from configuration.

use crate::circuit_breaker::CircuitBreaker;
use crate::retry::RetryManager;
use meshsim_core::config::PatternConfig;
use tracing::warn;

/// The patterns owned by one instance.
#[derive(Debug, Default)]
pub struct PatternSet {
    pub breaker: Option<CircuitBreaker>,
    pub retry: Option<RetryManager>,
}

impl PatternSet {
    /// Later entries of the same kind replace earlier ones.
    pub fn build(configs: &[PatternConfig]) -> Self {
        let mut set = PatternSet::default();
        for config in configs {
            match config {
                PatternConfig::CircuitBreaker(cb) => {
                    if set.breaker.is_some() {
                        warn!("duplicate circuit breaker configuration, keeping the last one");
                    }
                    set.breaker = Some(CircuitBreaker::new(cb.clone()));
                }
                PatternConfig::Retry(retry) => {
                    if set.retry.is_some() {
                        warn!("duplicate retry configuration, keeping the last one");
                    }
                    set.retry = Some(RetryManager::new(retry.clone()));
                }
            }
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.breaker.is_none() && self.retry.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsim_core::config::{CircuitBreakerConfig, RetryConfig};

    #[test]
    fn test_build_from_config() {
        assert!(PatternSet::build(&[]).is_empty());

        let set = PatternSet::build(&[
            PatternConfig::Retry(RetryConfig::default()),
            PatternConfig::CircuitBreaker(CircuitBreakerConfig::default()),
            PatternConfig::Retry(RetryConfig {
                max_tries: 1,
                ..Default::default()
            }),
        ]);
        assert!(set.breaker.is_some());
        assert_eq!(set.retry.as_ref().map(|r| r.config().max_tries), Some(1));
    }
}
