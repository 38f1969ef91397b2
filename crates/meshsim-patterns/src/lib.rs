//! Instance-owned resilience patterns.
//!
//! Patterns observe the internal requests their instance sends. They never
//! schedule events themselves: a breaker that opens returns a [`HalfOpenArm`]
//! the owner turns into a timer, and the retry manager returns a
//! [`RetryDecision`] the owner turns into a delayed send.

pub mod circuit_breaker;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    BreakerStats, BreakerStatus, CircuitBreaker, CircuitBreakerState, HalfOpenArm, SendVerdict,
};
pub use registry::PatternSet;
pub use retry::{RetryDecision, RetryManager};
