//! Bounded circular ring of free-slot pointers.
//!
//! # Design
//!
//! The allocator's free list: consumers claim pointers from `head` with a
//! CAS, a single refiller (the thread holding the collector lock) appends at
//! `tail`. Indices advance modulo the capacity; `head` never passes `tail`,
//! so at most `capacity - 1` entries are usable. The ring never hands out an
//! entry that the refiller has not published.
//!
//! # Ordering
//!
//! ```text
//! Refiller writes entries, then Release-stores tail  ->  claimer Acquire-loads
//! tail, then reads the entry behind the winning head CAS
//! ```
//!
//! Entries are `AtomicPtr` because a claimer with a stale `head` may read a
//! cell the refiller is rewriting; the claim CAS discards such reads, but the
//! access itself must still be atomic.
//!
//! Refills are batched: entries become visible only when the refiller
//! publishes, so claimers spin through an in-progress refill rather than
//! racing it entry by entry.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use std::ptr::NonNull;

use crossbeam_utils::CachePadded;

/// Circular free list with CAS-claimed head and single-writer tail.
pub struct FreeRing<T> {
    /// Consumer index. Claimers CAS this forward.
    head: CachePadded<AtomicUsize>,
    /// Producer index. Written only by the refiller, published Release.
    tail: CachePadded<AtomicUsize>,
    slots: Box<[AtomicPtr<T>]>,
}

impl<T> FreeRing<T> {
    /// Create an empty ring with `capacity` cells (`capacity - 1` usable).
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "free ring needs at least 2 cells");
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim one pointer, or `None` if the ring is empty.
    ///
    /// The entry is read before the CAS: while `head` is in the published
    /// region the cell is stable, and a successful CAS proves it still was.
    #[inline]
    pub fn try_claim(&self) -> Option<NonNull<T>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let ptr = self.slots[head].load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    (head + 1) % self.slots.len(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // A published entry is never null.
                return Some(NonNull::new(ptr).expect("free ring published a null entry"));
            }
        }
    }

    /// Number of claimable entries right now. Advisory; racing claimers can
    /// invalidate it immediately.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            self.slots.len() - head + tail
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Begin a batched refill. Caller must be the sole refiller (the
    /// collector-lock holder); entries become claimable only on
    /// [`Refill::publish`].
    pub fn begin_refill(&self) -> Refill<'_, T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        // Mirror of len(): free space keeps one cell as the full/empty
        // disambiguator.
        let space = if tail >= head {
            self.slots.len() - 1 - (tail - head)
        } else {
            head - tail - 1
        };
        Refill {
            ring: self,
            tail,
            space,
        }
    }
}

/// In-progress batched refill. Dropping without [`publish`](Self::publish)
/// abandons the appended entries.
pub struct Refill<'a, T> {
    ring: &'a FreeRing<T>,
    tail: usize,
    space: usize,
}

impl<T> Refill<'_, T> {
    /// Cells still appendable in this batch.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.space
    }

    /// Append one pointer. Returns `false` (without appending) once the
    /// batch is full.
    #[inline]
    pub fn push(&mut self, ptr: NonNull<T>) -> bool {
        if self.space == 0 {
            return false;
        }
        self.ring.slots[self.tail].store(ptr.as_ptr(), Ordering::Relaxed);
        self.tail = (self.tail + 1) % self.ring.slots.len();
        self.space -= 1;
        true
    }

    /// Publish every appended entry to claimers.
    pub fn publish(self) {
        self.ring.tail.store(self.tail, Ordering::Release);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fill<T>(ring: &FreeRing<T>, ptrs: &[NonNull<T>]) -> usize {
        let mut refill = ring.begin_refill();
        let mut pushed = 0;
        for &p in ptrs {
            if !refill.push(p) {
                break;
            }
            pushed += 1;
        }
        refill.publish();
        pushed
    }

    #[test]
    fn empty_ring_claims_nothing() {
        let ring: FreeRing<u64> = FreeRing::new(8);
        assert!(ring.try_claim().is_none());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn fifo_order_and_capacity_minus_one() {
        let cells: Vec<u64> = (0..16).collect();
        let ptrs: Vec<NonNull<u64>> =
            cells.iter().map(|c| NonNull::from(c)).collect();

        let ring: FreeRing<u64> = FreeRing::new(8);
        // Only capacity - 1 cells are usable.
        assert_eq!(fill(&ring, &ptrs), 7);
        assert_eq!(ring.len(), 7);

        for expected in cells.iter().take(7) {
            let got = ring.try_claim().expect("entry");
            assert_eq!(unsafe { *got.as_ref() }, *expected);
        }
        assert!(ring.try_claim().is_none());
    }

    #[test]
    fn wraparound_refills() {
        let cells: Vec<u64> = (0..64).collect();
        let ptrs: Vec<NonNull<u64>> =
            cells.iter().map(|c| NonNull::from(c)).collect();

        let ring: FreeRing<u64> = FreeRing::new(8);
        let mut next = 0usize;
        // Repeated partial fill/drain walks the indices around the ring.
        for _ in 0..10 {
            let pushed = fill(&ring, &ptrs[next..next + 5]);
            assert_eq!(pushed, 5);
            for expected in &cells[next..next + 5] {
                let got = ring.try_claim().expect("entry");
                assert_eq!(unsafe { *got.as_ref() }, *expected);
            }
            assert!(ring.try_claim().is_none());
            next += 5;
        }
    }

    #[test]
    fn unpublished_refill_is_invisible() {
        let cell = 7u64;
        let ring: FreeRing<u64> = FreeRing::new(4);
        let mut refill = ring.begin_refill();
        assert!(refill.push(NonNull::from(&cell)));
        // Not published yet.
        assert!(ring.try_claim().is_none());
        refill.publish();
        assert!(ring.try_claim().is_some());
    }

    /// Concurrent claimers never receive the same entry twice.
    #[test]
    fn concurrent_claim_no_double_delivery() {
        const CELLS: usize = 1024;
        const THREADS: usize = 4;

        let cells: Arc<Vec<AtomicUsize>> =
            Arc::new((0..CELLS).map(|_| AtomicUsize::new(0)).collect());
        let ring: Arc<FreeRing<AtomicUsize>> = Arc::new(FreeRing::new(CELLS + 1));

        let ptrs: Vec<NonNull<AtomicUsize>> =
            cells.iter().map(NonNull::from).collect();
        assert_eq!(fill(&ring, &ptrs), CELLS);

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                let mut claimed = 0usize;
                while let Some(cell) = ring.try_claim() {
                    // Mark delivery; a double delivery would double-count.
                    unsafe { cell.as_ref() }.fetch_add(1, Ordering::Relaxed);
                    claimed += 1;
                }
                claimed
            }));
        }

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, CELLS);
        for cell in cells.iter() {
            assert_eq!(cell.load(Ordering::Relaxed), 1);
        }
    }
}

#[cfg(all(test, feature = "stdx-proptest"))]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Claim,
        Refill(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Claim), (1u8..8).prop_map(Op::Refill)]
    }

    proptest! {
        /// Random interleavings of claims and batched refills stay FIFO
        /// and never deliver an entry twice.
        #[test]
        fn fifo_and_exclusive_delivery(ops in proptest::collection::vec(op_strategy(), 0..200)) {
            let cells: Vec<u64> = (0..2048).collect();
            let ring: FreeRing<u64> = FreeRing::new(16);
            let mut next = 0usize;
            let mut expected = std::collections::VecDeque::new();

            for op in &ops {
                match op {
                    Op::Claim => match ring.try_claim() {
                        Some(p) => {
                            let exp = expected.pop_front().expect("claim from empty ring");
                            prop_assert_eq!(unsafe { *p.as_ref() }, exp);
                        }
                        None => prop_assert!(expected.is_empty()),
                    },
                    Op::Refill(n) => {
                        let mut refill = ring.begin_refill();
                        for _ in 0..*n {
                            if next == cells.len() || !refill.push(NonNull::from(&cells[next])) {
                                break;
                            }
                            expected.push_back(cells[next]);
                            next += 1;
                        }
                        refill.publish();
                    }
                }
            }
            prop_assert_eq!(ring.len(), expected.len());
        }
    }
}
