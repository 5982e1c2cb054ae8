//! Task payloads executed by workers.
//!
//! Tasks are small `Copy` data interpreted by the scheduler's runner, not
//! boxed closures: deque slots are preallocated and stolen by value, frame
//! wrappers point into the publishing worker's stack. Raw pointers inside
//! the variants target cells that the frame and mailbox protocols keep
//! alive for as long as the task can run (publication happens-before
//! execution, completion happens-before reclamation).

use std::sync::atomic::{AtomicU32, AtomicU64};

#[derive(Clone, Copy, Debug)]
pub enum TaskKind {
    Nop,
    /// Diagnostic task: add one to the counter. Used by tests and the
    /// external-injection smoke path.
    Probe { hits: *const AtomicU64 },
    /// Body run by every non-publishing worker during a new frame: steal
    /// until `done` is set.
    InnerStealLoop { done: *const AtomicU32 },
    /// Publisher body of `run_new_frame`: run `inner`, then set `done`.
    NewFrameRoot {
        inner: *const TaskKind,
        done: *const AtomicU32,
    },
    /// Body run by every worker during `run_together`: run `inner`, count
    /// down `left`, then steal until it reaches zero.
    TogetherRoot {
        inner: *const TaskKind,
        left: *const AtomicU32,
    },
    /// Sweep the set engine's store. Only ever runs inside a frame, with
    /// every other worker parked in its steal loop.
    EngineCollect,
    /// Mailbox wrapper: the receiving worker publishes `inner` as a new
    /// frame on behalf of a non-worker thread.
    WrapNewFrame { inner: *const TaskKind },
    /// Mailbox wrapper: same, for a together frame.
    WrapTogether { inner: *const TaskKind },
}

// SAFETY: the embedded pointers reference cells owned by a blocked
// publisher (frame or mailbox). The publishing protocols guarantee the
// cells outlive every copy of the task, and the pointees are atomics or
// read-only task data, so cross-thread access is sound.
unsafe impl Send for TaskKind {}
unsafe impl Sync for TaskKind {}
