//! Shared identifiers and value types used across meshsim crates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

/// Simulated time in seconds.
///
/// Totally ordered via [`f64::total_cmp`] so it can key ordered collections.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(pub f64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0.0);

    pub fn as_secs(self) -> f64 {
        self.0
    }
}

impl PartialEq for SimTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SimTime {}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Add<f64> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: f64) -> SimTime {
        SimTime(self.0 + rhs)
    }
}

impl Sub for SimTime {
    type Output = f64;

    fn sub(self, rhs: SimTime) -> f64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $inner:ty, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Handle of a scheduled kernel event.
    EventId, u64, "ev-"
);
id_type!(
    /// Arena key of a request (user, internal or answer).
    RequestId, u64, "req-"
);
id_type!(
    /// Arena key of a network dependency.
    DependencyId, u64, "dep-"
);
id_type!(ProcessId, u64, "proc-");
id_type!(ServiceId, usize, "svc-");
id_type!(OperationId, usize, "op-");

/// Identity of a microservice instance: owning service plus a per-service index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub service: ServiceId,
    pub index: u32,
}

impl InstanceKey {
    pub fn new(service: ServiceId, index: u32) -> Self {
        Self { service, index }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.service, self.index)
    }
}

/// Why a simulated request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A dependency of the request failed for good.
    DependencyNotAvailable,
    /// The circuit towards the target service is open.
    CircuitOpen,
    /// Too many concurrent connections towards the target service.
    VolumeThresholdReached,
    /// The retry budget of the dependency is spent.
    MaxRetriesReached,
    /// The target service had no instance able to take the request.
    NoInstanceAvailable,
    HandlingInstanceDied,
    RequestingInstanceDied,
}

impl FailureReason {
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::DependencyNotAvailable => "dependency_not_available",
            FailureReason::CircuitOpen => "circuit_open",
            FailureReason::VolumeThresholdReached => "volume_threshold_reached",
            FailureReason::MaxRetriesReached => "max_retries_reached",
            FailureReason::NoInstanceAvailable => "no_instance_available",
            FailureReason::HandlingInstanceDied => "handling_instance_died",
            FailureReason::RequestingInstanceDied => "requesting_instance_died",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
