//! Discrete-event kernel.
//!
//! ```text
//!   schedule_at / schedule_in ──► EventQueue (BTreeMap<EventKey, E>)
//!                                    │ pop_next: advances now
//!                                    ▼
//!                              owner's handler ──► schedules more
//! ```
//!
//! Events are ordered by time, then priority (higher first), then the order
//! in which they were scheduled. The same seed and the same sequence of
//! calls always yields the same trace.

pub mod context;
pub mod event_queue;

pub use context::SimContext;
pub use event_queue::{EventKey, EventQueue, Priority};
