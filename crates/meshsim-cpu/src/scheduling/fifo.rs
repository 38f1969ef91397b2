use super::{Grant, Queued, SchedulingPolicy};
use meshsim_core::ProcessId;
use std::collections::VecDeque;

/// First come, first served. Every grant covers the full remaining demand.
#[derive(Debug, Default)]
pub struct Fifo {
    queue: VecDeque<Queued>,
}

impl SchedulingPolicy for Fifo {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn enter(&mut self, process: ProcessId, remaining: u64) {
        self.queue.push_back(Queued { process, remaining });
    }

    fn retrieve_next(&mut self) -> Option<Grant> {
        self.retrieve_next_no_reschedule()
    }

    fn retrieve_next_no_reschedule(&mut self) -> Option<Grant> {
        let entry = self.queue.pop_front()?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arrival_order_full_demand() {
        let mut fifo = Fifo::default();
        fifo.enter(ProcessId(1), 30);
        fifo.enter(ProcessId(2), 5);
        assert_eq!(fifo.total_demand(), 35);

        let first = fifo.retrieve_next().unwrap();
        assert_eq!((first.process, first.quantum), (ProcessId(1), 30));
        let second = fifo.retrieve_next().unwrap();
        assert_eq!((second.process, second.quantum), (ProcessId(2), 5));
        assert!(fifo.retrieve_next().is_none());
        assert!(!fifo.has_work());
    }
}
