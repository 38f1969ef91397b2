use super::{Grant, Queued, SchedulingPolicy};
use meshsim_core::ProcessId;
use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// Floor of the self-adjusting quantum; keeps context switches bounded.
pub const MIN_QUANTUM: u64 = 25;

/// Self-adjusting round robin.
///
/// The quantum of a round is the median remaining demand of the queued
/// processes, floored at the minimum quantum. It is recomputed when a process
/// enters or once the head of the ring has already run with the current quantum.
#[derive(Debug)]
pub struct RoundRobin {
    min_quantum: u64,
    ring: VecDeque<Queued>,
    executed_with_quantum: HashSet<ProcessId>,
    quantum: u64,
    needs_update: bool,
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new(MIN_QUANTUM)
    }
}

impl RoundRobin {
    pub fn new(min_quantum: u64) -> Self {
        Self {
            min_quantum,
            ring: VecDeque::new(),
            executed_with_quantum: HashSet::new(),
            quantum: min_quantum,
            needs_update: true,
        }
    }

    /// Quantum of the current round.
    pub fn quantum(&self) -> u64 {
        self.quantum
    }

    pub fn contains(&self, process: ProcessId) -> bool {
        self.ring.iter().any(|q| q.process == process)
    }

    fn update_quantum(&mut self) {
        self.executed_with_quantum.clear();
        self.needs_update = false;

        let mut demands: Vec<u64> = self.ring.iter().map(|q| q.remaining).collect();
        if demands.is_empty() {
            self.quantum = self.min_quantum;
            return;
        }
        demands.sort_unstable();

        let n = demands.len();
        // Even counts truncate the mean of the two middle values.
        let median = if n % 2 == 0 {
            (demands[n / 2 - 1] + demands[n / 2]) / 2
        } else {
            demands[n / 2]
        };
        self.quantum = median.max(self.min_quantum);
        trace!(quantum = self.quantum, queued = n, "round robin quantum updated");
    }

    fn take_front(&mut self) -> Option<(Queued, Grant)> {
        if self.needs_update {
            self.update_quantum();
        }
        let entry = self.ring.pop_front()?;
        self.executed_with_quantum.insert(entry.process);
        Some((entry, Grant::for_entry(entry, self.quantum)))
    }

    fn mark_round_end(&mut self) {
        if let Some(head) = self.ring.front() {
            if self.executed_with_quantum.contains(&head.process) {
                self.needs_update = true;
            }
        }
    }
}

impl SchedulingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn enter(&mut self, process: ProcessId, remaining: u64) {
        self.ring.push_back(Queued { process, remaining });
        self.needs_update = true;
    }

    fn retrieve_next(&mut self) -> Option<Grant> {
        let (entry, grant) = self.take_front()?;
        if !grant.finishes() {
            self.ring.push_back(Queued {
                process: entry.process,
                remaining: entry.remaining - grant.quantum,
            });
        }
        self.mark_round_end();
        Some(grant)
    }

    fn retrieve_next_no_reschedule(&mut self) -> Option<Grant> {
        let (_, grant) = self.take_front()?;
        self.mark_round_end();
        Some(grant)
    }

    fn total_demand(&self) -> u64 {
        self.ring.iter().map(|q| q.remaining).sum()
    }

    fn clear(&mut self) {
        self.ring.clear();
        self.executed_with_quantum.clear();
        self.needs_update = true;
    }

    fn len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantum_is_median_floored() {
        let mut rr = RoundRobin::default();
        rr.enter(ProcessId(1), 100);
        rr.enter(ProcessId(2), 300);
        rr.enter(ProcessId(3), 200);
        let grant = rr.retrieve_next().unwrap();
        assert_eq!(rr.quantum(), 200);
        assert_eq!((grant.process, grant.quantum), (ProcessId(1), 100));

        let mut rr = RoundRobin::default();
        rr.enter(ProcessId(1), 10);
        rr.enter(ProcessId(2), 12);
        rr.retrieve_next().unwrap();
        assert_eq!(rr.quantum(), MIN_QUANTUM);
    }

    #[test]
    fn test_even_median_truncates() {
        let mut rr = RoundRobin::new(1);
        rr.enter(ProcessId(1), 30);
        rr.enter(ProcessId(2), 41);
        rr.retrieve_next_no_reschedule().unwrap();
        assert_eq!(rr.quantum(), 35);
    }

    #[test]
    fn test_unfinished_process_moves_to_tail() {
        let mut rr = RoundRobin::default();
        rr.enter(ProcessId(1), 100);
        rr.enter(ProcessId(2), 30);
        rr.enter(ProcessId(3), 60);
        // median 60
        let g1 = rr.retrieve_next().unwrap();
        assert_eq!((g1.process, g1.quantum, g1.finishes()), (ProcessId(1), 60, false));
        let g2 = rr.retrieve_next().unwrap();
        assert_eq!((g2.process, g2.quantum), (ProcessId(2), 30));
        let g3 = rr.retrieve_next().unwrap();
        assert_eq!((g3.process, g3.quantum), (ProcessId(3), 60));
        assert_eq!(rr.len(), 1);
        assert_eq!(rr.total_demand(), 40);
        // process 1 already ran this round, so the quantum is recomputed
        let g4 = rr.retrieve_next().unwrap();
        assert_eq!(rr.quantum(), 40);
        assert_eq!((g4.process, g4.quantum), (ProcessId(1), 40));
        assert!(rr.is_empty());
    }

    #[test]
    fn test_no_reschedule_drops_process() {
        let mut rr = RoundRobin::default();
        rr.enter(ProcessId(1), 500);
        rr.enter(ProcessId(2), 100);
        let grant = rr.retrieve_next_no_reschedule().unwrap();
        assert_eq!(grant.quantum, 300);
        assert!(!grant.finishes());
        assert!(!rr.contains(ProcessId(1)));
        assert_eq!(rr.len(), 1);
    }

    #[test]
    fn test_clear_resets() {
        let mut rr = RoundRobin::default();
        rr.enter(ProcessId(1), 500);
        rr.clear();
        assert!(!rr.has_work());
        assert_eq!(rr.total_demand(), 0);
        assert!(rr.retrieve_next().is_none());
    }
}
