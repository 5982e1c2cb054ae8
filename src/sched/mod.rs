//! Cooperative work-stealing scheduler.
//!
//! One dedicated worker per producer thread plus an optional gated helper
//! pool, cooperating through split-window deques, a CAS-published frame
//! slot, and a reusable spin barrier. See [`scheduler::Scheduler`] for the
//! full picture.

pub mod barrier;
pub mod deque;
pub mod frame;
pub mod gate;
pub mod metrics;
pub mod rng;
pub mod scheduler;
pub mod task;

pub use metrics::{SchedulerStats, WorkerMetrics};
pub use scheduler::{Scheduler, WorkerCtx, WorkerState};
pub use task::TaskKind;
