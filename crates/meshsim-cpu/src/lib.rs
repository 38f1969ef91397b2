//! CPU model of a microservice instance.
//!
//! ```text
//!  submit(demand) ──► SchedulingPolicy ──grant──► active set (≤ pool size)
//!                          ▲                            │ burst of quantum / cpt
//!                          └──── remaining > 0 ◄────────┘ on_burst_completed
//! ```
//!
//! The CPU never touches the event queue directly; bursts are scheduled and
//! cancelled through the [`BurstScheduler`] seam.

pub mod cpu;
pub mod process;
pub mod scheduling;

pub use cpu::{BurstOutcome, BurstScheduler, Cpu};
pub use process::CpuProcess;
pub use scheduling::{Grant, SchedulingPolicy, build_policy};
