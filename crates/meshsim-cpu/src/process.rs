//! A unit of CPU work with integer demand.

use meshsim_core::{EventId, ProcessId, RequestId, SimError, SimResult, SimTime};

#[derive(Debug, Clone, PartialEq)]
pub struct CpuProcess {
    id: ProcessId,
    demand_total: u64,
    remainder: u64,
    burst_started: Option<SimTime>,
    pending_burst: Option<EventId>,
    request: Option<RequestId>,
}

impl CpuProcess {
    /// A zero demand is allowed and completes with an empty burst.
    pub fn new(id: ProcessId, demand: u64, request: Option<RequestId>) -> Self {
        Self {
            id,
            demand_total: demand,
            remainder: demand,
            burst_started: None,
            pending_burst: None,
            request,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn demand_total(&self) -> u64 {
        self.demand_total
    }

    /// Remaining demand as of the start of the latest burst.
    pub fn remainder(&self) -> u64 {
        self.remainder
    }

    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    pub fn is_finished(&self) -> bool {
        self.remainder == 0
    }

    /// Remaining demand at `now` while a burst is running at `capacity_per_thread`.
    pub fn remaining_at(&self, now: SimTime, capacity_per_thread: f64) -> f64 {
        let running = self.burst_started.map_or(0.0, |start| now - start);
        self.remainder as f64 - running * capacity_per_thread
    }

    pub fn reduce(&mut self, amount: u64) -> SimResult<()> {
        if amount > self.remainder {
            return Err(SimError::DemandUnderflow {
                process: self.id,
                remaining: self.remainder,
                amount,
            });
        }
        self.remainder -= amount;
        Ok(())
    }

    pub fn stamp_burst_started(&mut self, at: SimTime, completion: EventId) {
        self.burst_started = Some(at);
        self.pending_burst = Some(completion);
    }

    pub fn pending_burst(&self) -> Option<EventId> {
        self.pending_burst
    }

    /// Forget the pending completion and hand it back for cancellation.
    /// Returns `None` when nothing is pending.
    pub fn take_pending_burst(&mut self) -> Option<EventId> {
        self.burst_started = None;
        self.pending_burst.take()
    }
}
