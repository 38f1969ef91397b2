//! Microservice instances, services and the simulation loop.
//!
//! ```text
//!  Generator ──Generate──► Simulation ──Arrive──► MicroserviceInstance
//!                             ▲   │                 │  cpu.submit / bursts
//!                             │   └─ LoadBalancer   │  dependencies ──Send──►
//!                             └──── Fail / answers ◄┘
//! ```
//!
//! [`Simulation`] owns every piece of mutable state. Requests live in the
//! [`RequestArena`] and are referenced by id; instances get the shared state
//! through an [`InstanceCtx`] for the duration of one handler.

pub mod event;
pub mod generator;
pub mod instance;
pub mod load_balancer;
pub mod microservice;
pub mod network;
pub mod operation;
pub mod report;
pub mod request;
pub mod simulation;

pub use event::SimEvent;
pub use generator::{Generator, LoadProfile};
pub use instance::{InstanceCtx, InstanceState, MicroserviceInstance};
pub use load_balancer::{Candidate, LoadBalancer};
pub use microservice::Microservice;
pub use network::{DelayInjection, Network};
pub use operation::{DependencyDescription, Operation, OperationRegistry};
pub use report::{
    DataPoint, DependencyGraph, GraphLink, GraphNode, Reporter, ResponseTimes, RunStats,
    SimulationSummary,
};
pub use request::{NetworkDependency, Request, RequestArena, RequestKind, Requester};
pub use simulation::Simulation;
