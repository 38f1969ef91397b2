//! Thread-pool CPU that turns policy grants into timed bursts.

use crate::process::CpuProcess;
use crate::scheduling::SchedulingPolicy;
use indexmap::IndexSet;
use meshsim_core::{EventId, ProcessId, RequestId, SimError, SimResult, SimTime};
use std::collections::HashMap;
use tracing::trace;

/// Event-kernel access the CPU needs to time its bursts.
pub trait BurstScheduler {
    fn now(&self) -> SimTime;

    /// Schedule the completion of a burst of `quantum` demand units `after` seconds from now.
    fn schedule_burst(&mut self, process: ProcessId, quantum: u64, after: f64) -> EventId;

    fn cancel_burst(&mut self, event: EventId) -> bool;
}

/// Result of a completed burst.
#[derive(Debug, Clone, PartialEq)]
pub enum BurstOutcome {
    /// Demand remains; the process went back into the policy.
    Continuing,
    /// The process has no demand left and left the CPU.
    Finished(CpuProcess),
}

#[derive(Debug)]
pub struct Cpu {
    capacity: u64,
    thread_pool_size: usize,
    capacity_per_thread: f64,
    policy: Box<dyn SchedulingPolicy>,
    processes: HashMap<ProcessId, CpuProcess>,
    /// Processes with a running burst; never larger than the thread pool.
    active: IndexSet<ProcessId>,
    next_process: u64,
}

impl Cpu {
    /// A pool size of zero is raised to one.
    pub fn new(capacity: u64, thread_pool_size: usize, policy: Box<dyn SchedulingPolicy>) -> Self {
        let thread_pool_size = thread_pool_size.max(1);
        Self {
            capacity,
            thread_pool_size,
            capacity_per_thread: capacity as f64 / thread_pool_size as f64,
            policy,
            processes: HashMap::new(),
            active: IndexSet::with_capacity(thread_pool_size),
            next_process: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn thread_pool_size(&self) -> usize {
        self.thread_pool_size
    }

    pub fn capacity_per_thread(&self) -> f64 {
        self.capacity_per_thread
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn process(&self, id: ProcessId) -> Option<&CpuProcess> {
        self.processes.get(&id)
    }

    /// Create a process for `demand` units of work and start it if a thread is free.
    pub fn submit(
        &mut self,
        demand: u64,
        request: Option<RequestId>,
        scheduler: &mut dyn BurstScheduler,
    ) -> ProcessId {
        let id = ProcessId(self.next_process);
        self.next_process += 1;
        self.processes.insert(id, CpuProcess::new(id, demand, request));
        self.policy.enter(id, demand);
        trace!(process = %id, demand, "process submitted");
        self.dispatch(scheduler);
        id
    }

    fn dispatch(&mut self, scheduler: &mut dyn BurstScheduler) {
        while self.active.len() < self.thread_pool_size {
            let Some(grant) = self.policy.retrieve_next_no_reschedule() else {
                break;
            };
            let Some(process) = self.processes.get_mut(&grant.process) else {
                continue;
            };
            let duration = grant.quantum as f64 / self.capacity_per_thread;
            let event = scheduler.schedule_burst(grant.process, grant.quantum, duration);
            process.stamp_burst_started(scheduler.now(), event);
            self.active.insert(grant.process);
            trace!(
                process = %grant.process,
                quantum = grant.quantum,
                duration,
                "burst started"
            );
        }
    }

    /// Apply a finished burst of `quantum` units and refill free threads.
    pub fn on_burst_completed(
        &mut self,
        id: ProcessId,
        quantum: u64,
        scheduler: &mut dyn BurstScheduler,
    ) -> SimResult<BurstOutcome> {
        let process = self
            .processes
            .get_mut(&id)
            .ok_or(SimError::UnknownProcess(id))?;
        process.reduce(quantum)?;
        process.take_pending_burst();
        self.active.shift_remove(&id);

        let outcome = if process.is_finished() {
            match self.processes.remove(&id) {
                Some(done) => BurstOutcome::Finished(done),
                None => return Err(SimError::UnknownProcess(id)),
            }
        } else {
            trace!(process = %id, remaining = process.remainder(), "burst completed, demand left");
            self.policy.enter(id, process.remainder());
            BurstOutcome::Continuing
        };

        self.dispatch(scheduler);
        Ok(outcome)
    }

    /// Drop all running and queued processes, cancelling pending bursts.
    pub fn clear(&mut self, scheduler: &mut dyn BurstScheduler) -> Vec<CpuProcess> {
        for id in self.active.drain(..) {
            if let Some(process) = self.processes.get_mut(&id) {
                if let Some(event) = process.take_pending_burst() {
                    scheduler.cancel_burst(event);
                }
            }
        }
        self.policy.clear();
        let mut dropped: Vec<CpuProcess> = self.processes.drain().map(|(_, p)| p).collect();
        dropped.sort_by_key(|p| p.id());
        dropped
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Queued plus running processes.
    pub fn process_count(&self) -> usize {
        self.policy.len() + self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && !self.policy.has_work()
    }

    /// Share of busy threads.
    pub fn usage(&self) -> f64 {
        self.active.len() as f64 / self.thread_pool_size as f64
    }

    /// Outstanding demand relative to what the whole pool completes per second.
    pub fn relative_work_demand(&self, now: SimTime) -> f64 {
        let queued = self.policy.total_demand() as f64;
        let running: f64 = self
            .active
            .iter()
            .filter_map(|id| self.processes.get(id))
            .map(|p| p.remaining_at(now, self.capacity_per_thread))
            .sum();
        let total_capacity = self.thread_pool_size as f64 * self.capacity_per_thread;
        if total_capacity <= 0.0 {
            return 0.0;
        }
        round_significant((queued + running) / total_capacity, 14)
    }
}

fn round_significant(value: f64, digits: i32) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32 + 1;
    let scale = 10f64.powi(digits - magnitude);
    (value * scale).round() / scale
}
