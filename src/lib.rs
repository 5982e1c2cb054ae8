//! Provenance tag runtime for a multi-threaded analysis tool.
//!
//! ## Scope
//! This crate tracks provenance "tags" attached to memory bytes. Tags are
//! opaque handles over canonicalized byte-offset sets; allocating and
//! combining them sits on the hot path of every tracked memory access, so
//! the whole runtime is built around spin synchronization and per-thread
//! ownership instead of blocking locks.
//!
//! ## Key invariants
//! - A slot's reference count equals the exact number of live handles over
//!   it; engine-side release happens only in collector sweeps, never at
//!   the instant a count reaches zero.
//! - The set engine is mutated only inside request-slot handlers: one
//!   dedicated worker per producer, one request in flight at a time.
//! - Exactly one thread sweeps the slot arena at any instant, and frames
//!   are the only mechanism that pauses every worker at a safe point.
//!
//! ## Data flow
//! `Producer -> RequestSlot -> dedicated worker -> SetEngine`, with the
//! allocator turning engine results into [`TagHandle`]s backed by slots
//! from a shared free ring, and the collector refilling that ring.
//!
//! ## Notable entry points
//! - [`TagSystem`] / [`Producer`]: lifecycle and the hot-path operations.
//! - [`Config`]: startup knobs.
//! - [`engine::SetEngine`] / [`CanonicalStore`]: the set-engine seam.
//! - [`sched::Scheduler`]: the work-stealing substrate, usable on its own.

pub mod config;
pub mod engine;
pub mod sched;
pub mod stdx;
pub mod tag;

pub use config::Config;
pub use engine::{CanonicalStore, SetEngine, SetHandle, NO_SET};
pub use tag::{
    AuditReport, Producer, ProducerStats, SlotCensus, SystemStats, TagHandle, TagSystem,
};
