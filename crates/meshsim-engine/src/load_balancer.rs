//! Load balancing across the running instances of one service.
//!
//! The balancer only ever sees candidates the owning service considers
//! routable (running instances). It records how often each instance was
//! picked so the reporter can show the load distribution.

use meshsim_core::config::BalancerKind;
use meshsim_core::{InstanceKey, SimError, SimResult};
use rand::Rng;
use std::collections::BTreeMap;

/// A routable instance and what the strategies need to know about it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub key: InstanceKey,
    pub relative_demand: f64,
}

/// Rotating index into a candidate list whose length may change between calls.
#[derive(Debug, Default)]
pub struct RoundRobinCounter {
    counter: usize,
}

impl RoundRobinCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the next index, wrapping around `count`.
    ///
    /// Returns `None` if count is zero.
    pub fn next(&mut self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let idx = self.counter;
        self.counter = self.counter.wrapping_add(1);
        Some(idx % count)
    }
}

#[derive(Debug)]
pub struct LoadBalancer {
    service: String,
    kind: BalancerKind,
    round_robin: RoundRobinCounter,
    /// Selections per instance over the whole run.
    selections: BTreeMap<InstanceKey, u64>,
}

impl LoadBalancer {
    pub fn new(service: impl Into<String>, kind: BalancerKind) -> Self {
        Self {
            service: service.into(),
            kind,
            round_robin: RoundRobinCounter::new(),
            selections: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> BalancerKind {
        self.kind
    }

    /// Pick one of `candidates` and record the selection.
    pub fn select<R: Rng + ?Sized>(
        &mut self,
        candidates: &[Candidate],
        rng: &mut R,
    ) -> SimResult<InstanceKey> {
        if candidates.is_empty() {
            return Err(SimError::NoInstanceAvailable(self.service.clone()));
        }
        let chosen = match self.kind {
            BalancerKind::Random => candidates[rng.gen_range(0..candidates.len())].key,
            BalancerKind::Even => {
                // Fewest selections so far; first candidate wins ties.
                let mut best = candidates[0].key;
                let mut best_count = self.selections_of(best);
                for c in &candidates[1..] {
                    let count = self.selections_of(c.key);
                    if count < best_count {
                        best = c.key;
                        best_count = count;
                    }
                }
                best
            }
            BalancerKind::Utilization => {
                let mut best = candidates[0];
                for c in &candidates[1..] {
                    if c.relative_demand < best.relative_demand {
                        best = *c;
                    }
                }
                best.key
            }
            BalancerKind::RoundRobin => {
                let idx = self.round_robin.next(candidates.len()).unwrap_or(0);
                candidates[idx].key
            }
        };
        *self.selections.entry(chosen).or_insert(0) += 1;
        Ok(chosen)
    }

    pub fn selections_of(&self, key: InstanceKey) -> u64 {
        self.selections.get(&key).copied().unwrap_or(0)
    }

    /// Share of all selections that went to each instance.
    pub fn selection_frequency(&self) -> BTreeMap<InstanceKey, f64> {
        let total: u64 = self.selections.values().sum();
        if total == 0 {
            return BTreeMap::new();
        }
        self.selections
            .iter()
            .map(|(key, count)| (*key, *count as f64 / total as f64))
            .collect()
    }

    pub fn total_selections(&self) -> u64 {
        self.selections.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsim_core::ServiceId;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn candidates(demands: &[f64]) -> Vec<Candidate> {
        demands
            .iter()
            .enumerate()
            .map(|(i, d)| Candidate {
                key: InstanceKey::new(ServiceId(0), i as u32),
                relative_demand: *d,
            })
            .collect()
    }

    fn key(index: u32) -> InstanceKey {
        InstanceKey::new(ServiceId(0), index)
    }

    #[test]
    fn test_round_robin_zero_count_returns_none() {
        let mut rr = RoundRobinCounter::new();
        assert_eq!(rr.next(0), None);
        assert_eq!(rr.next(2), Some(0));
    }

    #[test]
    fn test_empty_candidates_is_no_instance_available() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut lb = LoadBalancer::new("api", BalancerKind::Random);
        assert_eq!(
            lb.select(&[], &mut rng),
            Err(SimError::NoInstanceAvailable("api".to_string()))
        );
    }

    #[test]
    fn test_even_spreads_selections() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut lb = LoadBalancer::new("api", BalancerKind::Even);
        let c = candidates(&[0.0, 0.0, 0.0]);
        for _ in 0..9 {
            lb.select(&c, &mut rng).unwrap();
        }
        for i in 0..3 {
            assert_eq!(lb.selections_of(key(i)), 3);
        }
        let freq = lb.selection_frequency();
        assert!((freq[&key(1)] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_utilization_picks_least_loaded() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut lb = LoadBalancer::new("api", BalancerKind::Utilization);
        assert_eq!(lb.select(&candidates(&[0.8, 0.2, 0.2]), &mut rng), Ok(key(1)));
        assert_eq!(lb.select(&candidates(&[0.0, 0.5]), &mut rng), Ok(key(0)));
    }

    #[test]
    fn test_random_stays_within_candidates() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut lb = LoadBalancer::new("api", BalancerKind::Random);
        let c = candidates(&[0.0, 0.0]);
        for _ in 0..50 {
            let k = lb.select(&c, &mut rng).unwrap();
            assert!(k.index < 2);
        }
        assert_eq!(lb.total_selections(), 50);
    }

    #[test]
    fn test_round_robin_strategy_rotates() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut lb = LoadBalancer::new("api", BalancerKind::RoundRobin);
        let c = candidates(&[0.0, 0.0]);
        let picks: Vec<u32> = (0..4)
            .map(|_| lb.select(&c, &mut rng).unwrap().index)
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }
}
