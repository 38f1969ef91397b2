//! Simulation events and their priorities.

use meshsim_core::{FailureReason, InstanceKey, ProcessId, RequestId, ServiceId};
use meshsim_kernel::Priority;

/// Burst completions outrank everything else due at the same instant.
pub const BURST_PRIORITY: Priority = 10;
pub const NETWORK_PRIORITY: Priority = 5;
pub const LIFECYCLE_PRIORITY: Priority = 0;
pub const AUTOSCALE_PRIORITY: Priority = -5;
pub const REPORT_PRIORITY: Priority = -10;

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// A workload generator fires its next user request.
    Generate { generator: usize },
    /// A request or answer leaves its sender.
    Send { request: RequestId },
    /// A request or answer reaches an instance.
    Arrive {
        request: RequestId,
        instance: InstanceKey,
    },
    /// A request failed; delivered to its requester.
    Fail {
        request: RequestId,
        reason: FailureReason,
    },
    BurstCompleted {
        instance: InstanceKey,
        process: ProcessId,
        quantum: u64,
    },
    HalfOpen {
        instance: InstanceKey,
        target: ServiceId,
    },
    Autoscale { service: ServiceId },
    Report,
    /// A scheduled orchestration or chaos action, by index into the experiment's events.
    Experiment { index: usize },
    /// A timed delay injection runs out.
    DelayEnded { index: usize },
}

impl SimEvent {
    pub fn priority(&self) -> Priority {
        match self {
            SimEvent::BurstCompleted { .. } => BURST_PRIORITY,
            SimEvent::Send { .. } | SimEvent::Arrive { .. } | SimEvent::Fail { .. } => {
                NETWORK_PRIORITY
            }
            SimEvent::Generate { .. }
            | SimEvent::HalfOpen { .. }
            | SimEvent::Experiment { .. }
            | SimEvent::DelayEnded { .. } => LIFECYCLE_PRIORITY,
            SimEvent::Autoscale { .. } => AUTOSCALE_PRIORITY,
            SimEvent::Report => REPORT_PRIORITY,
        }
    }
}
