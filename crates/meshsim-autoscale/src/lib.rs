//! meshsim-autoscale: demand-driven instance scaling.
//!
//! Each autoscaled service owns one [`Autoscaler`]. The simulation samples
//! the relative work demand of the service's running instances every
//! `interval` seconds and applies the returned [`ScaleDecision`] through the
//! service's level-triggered `scale_to`.
//!
//! # Scaling Algorithm
//!
//! ```text
//! avg    = mean relative work demand of running instances
//! target = autoscaler.target_demand
//!
//! if current outside [min, max]:
//!     ScaleTo(clamp(current))
//!
//! if avg > target * 1.1:
//!     desired = ceil(current * (avg / target))
//!     ScaleTo(min(desired, max_instances))
//!
//! if avg < target * 0.9 and current > min:
//!     desired = ceil(current * (avg / target))
//!     ScaleTo(max(desired, min_instances))
//! ```
//!
//! Hold windows (`scale_up_hold`, `scale_down_hold`) measured in simulated
//! seconds prevent rapid oscillation.

pub mod scaler;

pub use scaler::{Autoscaler, DemandSample, ScaleDecision};
