//! Sense-reversing spin barrier over the alive worker set.
//!
//! The frame protocol needs every alive worker to rendezvous several times
//! in quick succession, so the barrier must be reusable immediately: the
//! last arriver resets `count`, arms `leaving`, and flips the `wait` sense;
//! stragglers spin on the sense, not on the count. `leaving` lets teardown
//! wait until nobody is still inside a `wait` call.
//!
//! The participant count is passed per call (it is the alive-worker count,
//! which the spawn/exit lock holds stable for the duration of a frame).

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

pub struct FlipBarrier {
    count: CachePadded<AtomicU32>,
    leaving: CachePadded<AtomicU32>,
    wait: CachePadded<AtomicU32>,
}

impl FlipBarrier {
    pub fn new() -> Self {
        Self {
            count: CachePadded::new(AtomicU32::new(0)),
            leaving: CachePadded::new(AtomicU32::new(0)),
            wait: CachePadded::new(AtomicU32::new(0)),
        }
    }

    /// Wait until `participants` threads (including the caller) arrive.
    ///
    /// Every caller in one rendezvous must pass the same count.
    pub fn wait(&self, participants: u32) {
        debug_assert!(participants > 0);
        let wait = self.wait.load(Ordering::Acquire);
        if participants == self.count.fetch_add(1, Ordering::AcqRel) + 1 {
            // Last arriver: reset for reuse, then flip the sense.
            self.count.store(0, Ordering::Relaxed);
            self.leaving.store(participants, Ordering::Relaxed);
            self.wait.store(1 - wait, Ordering::Release);
        } else {
            while self.wait.load(Ordering::Acquire) == wait {
                std::hint::spin_loop();
            }
        }
        self.leaving.fetch_sub(1, Ordering::AcqRel);
    }

    /// Wait for every thread to leave the barrier. Teardown only.
    pub fn drain(&self) {
        while self.leaving.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
    }
}

impl Default for FlipBarrier {
    fn default() -> Self {
        Self::new()
    }
}
