//! Tag slot arena: block table, claim protocol, and the mark-free
//! collector.
//!
//! # Layout
//!
//! Slots live in fixed-size blocks, allocated on demand and appended to a
//! bounded table. Block storage is leaked: the data model says blocks live
//! until process shutdown, and leaking is what makes `&'static TagSlot`
//! inside handles sound. The free ring (capacity = one block) feeds
//! claimers.
//!
//! # Claim and collect
//!
//! Allocation CAS-claims the ring head. On empty, the claimer races for
//! the collector lock: the winner sweeps every block in allocation order,
//! parking free and never-used slots into the ring (releasing engine
//! protection for the former), stopping early once the ring is full;
//! losers spin until entries appear. If a full pass leaves more unfilled
//! ring space than the growth threshold, one new block is appended. At
//! most one sweep runs system-wide at any instant.
//!
//! Engine-side release is batched: it happens here, during a sweep, never
//! at the moment a count reaches zero.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use crossbeam_utils::CachePadded;

use crate::config::Config;
use crate::engine::{SetEngine, NO_SET};
use crate::stdx::FreeRing;

use super::handle::TagHandle;
use super::slot::{SlotState, TagSlot};

/// Arena counters, read after the fact.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArenaSnapshot {
    pub blocks: usize,
    pub sweeps: u64,
    pub blocks_grown: u64,
    pub slots_recovered: u64,
}

/// Point-in-time classification of every slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotCensus {
    pub live: usize,
    pub free: usize,
    pub never_used: usize,
    pub queued: usize,
}

/// Result of a consistency audit against a set of live roots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Live slots found.
    pub live: usize,
    /// Roots referencing a slot that is not live.
    pub dangling: usize,
    /// Live slots whose count is not explained by the given roots.
    pub leaked: usize,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.dangling == 0 && self.leaked == 0
    }
}

pub struct TagArena {
    free: FreeRing<TagSlot>,
    gc_lock: CachePadded<AtomicU32>,
    blocks: Box<[AtomicPtr<TagSlot>]>,
    n_blocks: AtomicUsize,
    block_size: usize,
    grow_threshold: usize,
    engine: Arc<dyn SetEngine>,
    sweeps: AtomicU64,
    blocks_grown: AtomicU64,
    slots_recovered: AtomicU64,
}

impl TagArena {
    pub fn new(cfg: &Config, engine: Arc<dyn SetEngine>) -> Self {
        let blocks = (0..cfg.max_blocks)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let arena = Self {
            free: FreeRing::new(cfg.block_size),
            gc_lock: CachePadded::new(AtomicU32::new(0)),
            blocks,
            n_blocks: AtomicUsize::new(0),
            block_size: cfg.block_size,
            grow_threshold: cfg.grow_threshold,
            engine,
            sweeps: AtomicU64::new(0),
            blocks_grown: AtomicU64::new(0),
            slots_recovered: AtomicU64::new(0),
        };
        arena.add_block();
        arena
    }

    /// Claim one slot, sweeping (or waiting on the sweeper) when the ring
    /// runs dry. The returned slot is live with count one.
    pub fn claim(&self) -> &'static TagSlot {
        loop {
            if let Some(ptr) = self.free.try_claim() {
                // SAFETY: ring entries point into leaked blocks.
                let slot = unsafe { &*ptr.as_ptr() };
                slot.acquire();
                return slot;
            }
            if self
                .gc_lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.sweep();
                self.gc_lock.store(0, Ordering::Release);
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Full sweep. Caller holds the collector lock.
    fn sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        let mut refill = self.free.begin_refill();
        let mut recovered = 0u64;

        let n_blocks = self.n_blocks.load(Ordering::Acquire);
        'blocks: for b in 0..n_blocks {
            for slot in self.block(b) {
                if refill.remaining() == 0 {
                    break 'blocks;
                }
                match slot.state() {
                    SlotState::Free => {
                        let h = slot.park_in_ring();
                        if h != NO_SET {
                            self.engine.unprotect(h);
                        }
                        refill.push(NonNull::from(slot));
                        recovered += 1;
                    }
                    SlotState::NeverUsed => {
                        slot.park_in_ring();
                        refill.push(NonNull::from(slot));
                        recovered += 1;
                    }
                    SlotState::Live(_) | SlotState::Queued => {}
                }
            }
        }

        let unfilled = refill.remaining();
        refill.publish();
        self.slots_recovered.fetch_add(recovered, Ordering::Relaxed);

        if unfilled > self.grow_threshold {
            self.add_block();
            self.blocks_grown.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Append one block and seed the ring from it. Fatal when the table is
    /// full: the arena has a hard memory ceiling.
    fn add_block(&self) {
        let idx = self.n_blocks.load(Ordering::Acquire);
        assert!(
            idx < self.blocks.len(),
            "tag arena exhausted at {} blocks; raise max_blocks",
            self.blocks.len()
        );
        let block: Box<[TagSlot]> = (0..self.block_size).map(|_| TagSlot::new()).collect();
        // Leaked on purpose: slots must stay valid for every outstanding
        // handle, which can outlive the arena value itself.
        let leaked: &'static mut [TagSlot] = Box::leak(block);
        self.blocks[idx].store(leaked.as_mut_ptr(), Ordering::Release);
        self.n_blocks.store(idx + 1, Ordering::Release);

        let mut refill = self.free.begin_refill();
        for slot in leaked.iter() {
            if refill.remaining() == 0 {
                break;
            }
            slot.park_in_ring();
            refill.push(NonNull::from(slot));
        }
        // Slots that did not fit stay never-used for later sweeps.
        refill.publish();
    }

    fn block(&self, i: usize) -> &'static [TagSlot] {
        let ptr = self.blocks[i].load(Ordering::Acquire);
        debug_assert!(!ptr.is_null());
        // SAFETY: published block pointers reference leaked arrays of
        // exactly block_size slots.
        unsafe { std::slice::from_raw_parts(ptr, self.block_size) }
    }

    /// Verify that every live slot's count is explained exactly by the
    /// given roots. Read-only; safe to run concurrently with producers,
    /// meaningful when they are quiescent.
    pub fn audit<'a, I>(&self, roots: I) -> AuditReport
    where
        I: IntoIterator<Item = &'a TagHandle>,
    {
        let mut expected: HashMap<*const TagSlot, u64, RandomState> =
            HashMap::with_hasher(RandomState::new());
        for h in roots {
            if let Some(p) = h.slot_ptr() {
                *expected.entry(p).or_insert(0) += 1;
            }
        }

        let mut report = AuditReport::default();
        for b in 0..self.n_blocks.load(Ordering::Acquire) {
            for slot in self.block(b) {
                if let SlotState::Live(n) = slot.state() {
                    report.live += 1;
                    match expected.remove(&(slot as *const TagSlot)) {
                        Some(k) if k == n => {}
                        _ => report.leaked += 1,
                    }
                }
            }
        }
        report.dangling = expected.len();
        report
    }

    pub fn census(&self) -> SlotCensus {
        let mut census = SlotCensus::default();
        for b in 0..self.n_blocks.load(Ordering::Acquire) {
            for slot in self.block(b) {
                match slot.state() {
                    SlotState::Live(_) => census.live += 1,
                    SlotState::Free => census.free += 1,
                    SlotState::NeverUsed => census.never_used += 1,
                    SlotState::Queued => census.queued += 1,
                }
            }
        }
        census
    }

    pub fn snapshot(&self) -> ArenaSnapshot {
        ArenaSnapshot {
            blocks: self.n_blocks.load(Ordering::Acquire),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            blocks_grown: self.blocks_grown.load(Ordering::Relaxed),
            slots_recovered: self.slots_recovered.load(Ordering::Relaxed),
        }
    }
}
