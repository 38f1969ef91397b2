use super::{Grant, Queued, SchedulingPolicy};
use meshsim_core::ProcessId;

/// Shortest process next. Long processes may starve while short ones keep arriving.
#[derive(Debug, Default)]
pub struct ShortestProcessNext {
    /// Ascending by remaining demand; equal demands keep arrival order.
    queue: Vec<Queued>,
}

impl SchedulingPolicy for ShortestProcessNext {
    fn name(&self) -> &'static str {
        "shortest_process_next"
    }

    fn enter(&mut self, process: ProcessId, remaining: u64) {
        let at = self.queue.partition_point(|q| q.remaining <= remaining);
        self.queue.insert(at, Queued { process, remaining });
    }

    fn retrieve_next(&mut self) -> Option<Grant> {
        self.retrieve_next_no_reschedule()
    }

    fn retrieve_next_no_reschedule(&mut self) -> Option<Grant> {
        if self.queue.is_empty() {
            return None;
        }
        let entry = self.queue.remove(0);
        Some(Grant::for_entry(entry, entry.remaining))
    }

    fn total_demand(&self) -> u64 {
        self.queue.iter().map(|q| q.remaining).sum()
    }

    fn clear(&mut self) {
        self.queue.clear();
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}
