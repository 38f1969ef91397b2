//! Latency model for internal requests and answers.

use meshsim_core::config::NetworkConfig;
use meshsim_core::{OperationId, ServiceId};
use rand::Rng;

/// Extra latency on requests sent by a service, or by one of its operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayInjection {
    pub service: ServiceId,
    pub operation: Option<OperationId>,
    pub extra: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Network {
    min_latency: f64,
    max_latency: f64,
    injections: Vec<DelayInjection>,
}

impl Network {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            min_latency: config.min_latency,
            max_latency: config.max_latency,
            injections: Vec::new(),
        }
    }

    /// Base latency of one hop, uniform in `[min_latency, max_latency]`.
    pub fn latency<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.max_latency > self.min_latency {
            rng.gen_range(self.min_latency..=self.max_latency)
        } else {
            self.min_latency
        }
    }

    /// Install an injection, replacing one with the same scope.
    pub fn inject(&mut self, injection: DelayInjection) {
        self.remove(injection.service, injection.operation);
        self.injections.push(injection);
    }

    pub fn remove(&mut self, service: ServiceId, operation: Option<OperationId>) {
        self.injections
            .retain(|i| !(i.service == service && i.operation == operation));
    }

    /// Injected delay for a request sent on behalf of `operation` of `service`.
    pub fn injected_delay(&self, service: ServiceId, operation: OperationId) -> f64 {
        self.injections
            .iter()
            .filter(|i| i.service == service && i.operation.is_none_or(|op| op == operation))
            .map(|i| i.extra)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_latency_within_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let net = Network::new(&NetworkConfig {
            min_latency: 0.01,
            max_latency: 0.02,
        });
        for _ in 0..100 {
            let l = net.latency(&mut rng);
            assert!((0.01..=0.02).contains(&l));
        }
        let fixed = Network::new(&NetworkConfig::default());
        assert_eq!(fixed.latency(&mut rng), 0.0);
    }

    #[test]
    fn test_injection_scopes() {
        let mut net = Network::default();
        let svc = ServiceId(0);
        net.inject(DelayInjection {
            service: svc,
            operation: None,
            extra: 0.5,
        });
        net.inject(DelayInjection {
            service: svc,
            operation: Some(OperationId(1)),
            extra: 0.25,
        });
        assert_eq!(net.injected_delay(svc, OperationId(0)), 0.5);
        assert_eq!(net.injected_delay(svc, OperationId(1)), 0.75);
        assert_eq!(net.injected_delay(ServiceId(1), OperationId(1)), 0.0);

        // same scope replaces
        net.inject(DelayInjection {
            service: svc,
            operation: None,
            extra: 1.0,
        });
        assert_eq!(net.injected_delay(svc, OperationId(0)), 1.0);
        net.remove(svc, None);
        assert_eq!(net.injected_delay(svc, OperationId(0)), 0.0);
    }
}
