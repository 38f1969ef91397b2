//! Simulator error types.
//!
//! These cover programmer and configuration errors. Failures of simulated
//! requests are not errors; they travel as [`FailureReason`](crate::FailureReason).

use crate::types::{DependencyId, ProcessId, RequestId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("illegal transition of {entity} from {from} on {action}")]
    IllegalTransition {
        entity: String,
        from: String,
        action: &'static str,
    },

    #[error("instance {instance} cannot handle {request} while {state}")]
    CannotHandle {
        instance: String,
        request: RequestId,
        state: String,
    },

    #[error("cannot reduce {process} by {amount}, only {remaining} demand left")]
    DemandUnderflow {
        process: ProcessId,
        remaining: u64,
        amount: u64,
    },

    #[error("unknown process: {0}")]
    UnknownProcess(ProcessId),

    #[error("unknown request: {0}")]
    UnknownRequest(RequestId),

    #[error("unknown dependency: {0}")]
    UnknownDependency(DependencyId),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("request {request} was not sent by instance {instance}")]
    NotRequestedHere { request: RequestId, instance: String },

    #[error("no instances available for service: {0}")]
    NoInstanceAvailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot read load profile {path}: {reason}")]
    ProfileUnreadable { path: String, reason: String },
}

pub type SimResult<T> = Result<T, SimError>;
