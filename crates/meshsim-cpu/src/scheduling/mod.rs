//! CPU scheduling policies.
//!
//! A policy is a pure queue of `(process, remaining demand)` entries. It knows
//! nothing about simulated time; it only decides which process runs next and
//! how much demand the next burst may consume.

mod feedback;
mod fifo;
mod round_robin;
mod shortest_first;

pub use feedback::MultiLevelFeedback;
pub use fifo::Fifo;
pub use round_robin::{MIN_QUANTUM, RoundRobin};
pub use shortest_first::ShortestProcessNext;

use meshsim_core::ProcessId;
use meshsim_core::config::PolicyConfig;
use std::fmt;

/// A process waiting in a policy with its demand left when it entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queued {
    pub process: ProcessId,
    pub remaining: u64,
}

/// Permission for one process to run a burst of `quantum` demand units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub process: ProcessId,
    pub quantum: u64,
    /// Demand left before the burst runs.
    pub remaining: u64,
}

impl Grant {
    fn for_entry(entry: Queued, quantum: u64) -> Self {
        Self {
            process: entry.process,
            quantum: quantum.min(entry.remaining),
            remaining: entry.remaining,
        }
    }

    /// Whether the burst consumes the whole remaining demand.
    pub fn finishes(&self) -> bool {
        self.quantum >= self.remaining
    }
}

pub trait SchedulingPolicy: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    fn enter(&mut self, process: ProcessId, remaining: u64);

    /// Take the next grant. A policy that preempts keeps the unfinished rest
    /// of the process queued as if the burst had already run.
    fn retrieve_next(&mut self) -> Option<Grant>;

    /// Take the next grant and drop the process from the queue. The caller
    /// enters it again after the burst if demand remains.
    fn retrieve_next_no_reschedule(&mut self) -> Option<Grant>;

    fn has_work(&self) -> bool {
        !self.is_empty()
    }

    /// Sum of the remaining demand of all queued processes.
    fn total_demand(&self) -> u64;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn build_policy(config: &PolicyConfig) -> Box<dyn SchedulingPolicy> {
    match config {
        PolicyConfig::Fifo => Box::new(Fifo::default()),
        PolicyConfig::ShortestProcessNext => Box::new(ShortestProcessNext::default()),
        PolicyConfig::RoundRobin { min_quantum } => {
            Box::new(RoundRobin::new(min_quantum.unwrap_or(MIN_QUANTUM)))
        }
        PolicyConfig::MultiLevelFeedback { levels } => Box::new(MultiLevelFeedback::new(
            levels.unwrap_or(feedback::DEFAULT_LEVELS),
        )),
    }
}
