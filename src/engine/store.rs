//! Canonicalizing offset-set store.
//!
//! Hash-consed sorted offset slices: one handle per distinct set, ever.
//! Interning is what gives the runtime its two load-bearing properties:
//! handle equality is set equality, and a combine whose result equals an
//! operand returns that operand's handle (structural sharing, no new
//! allocation upstream).
//!
//! Entries carry a nested protect count; `collect` drops everything
//! unprotected. The store promises nothing about concurrency beyond the
//! seam contract (mutation only from request handlers, collection only at
//! a safe point), so a single mutex around the maps is enough here; a
//! production decision-diagram engine would bring its own lock-free
//! tables.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use std::collections::HashMap;

use super::{SetEngine, SetHandle, NO_SET};

struct Entry {
    offsets: Arc<[u32]>,
    protect: u64,
}

struct StoreInner {
    by_set: HashMap<Arc<[u32]>, SetHandle, RandomState>,
    entries: HashMap<SetHandle, Entry, RandomState>,
    next_handle: SetHandle,
}

pub struct CanonicalStore {
    inner: Mutex<StoreInner>,
    /// Entry count mirrored outside the lock so `needs_collect` stays a
    /// single load on the request path.
    len: AtomicUsize,
    high_watermark: usize,
    collections: AtomicU64,
}

/// Rough per-entry footprint used to turn the byte ceiling into an entry
/// watermark: map overhead plus a small offset slice.
const APPROX_ENTRY_BYTES: usize = 256;

impl CanonicalStore {
    pub fn new(memory_limit: usize) -> Self {
        let high_watermark = (memory_limit / APPROX_ENTRY_BYTES).max(16);
        let hasher = RandomState::new();
        Self {
            inner: Mutex::new(StoreInner {
                by_set: HashMap::with_hasher(hasher.clone()),
                entries: HashMap::with_hasher(hasher),
                next_handle: 1,
            }),
            len: AtomicUsize::new(0),
            high_watermark,
            collections: AtomicU64::new(0),
        }
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collections run so far.
    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Acquire)
    }

    fn intern(&self, offsets: Arc<[u32]>) -> SetHandle {
        debug_assert!(offsets.windows(2).all(|w| w[0] < w[1]), "set not sorted");
        let mut inner = self.inner.lock().expect("store poisoned");
        if let Some(&h) = inner.by_set.get(&offsets) {
            return h;
        }
        let h = inner.next_handle;
        inner.next_handle += 1;
        inner.by_set.insert(Arc::clone(&offsets), h);
        inner.entries.insert(
            h,
            Entry {
                offsets,
                protect: 0,
            },
        );
        self.len.store(inner.entries.len(), Ordering::Release);
        h
    }

    fn entry_offsets(inner: &StoreInner, h: SetHandle) -> Arc<[u32]> {
        Arc::clone(
            &inner
                .entries
                .get(&h)
                .unwrap_or_else(|| panic!("set engine handle {h} is not live"))
                .offsets,
        )
    }
}

impl SetEngine for CanonicalStore {
    fn singleton(&self, offset: u32) -> SetHandle {
        self.intern(Arc::from([offset].as_slice()))
    }

    fn combine(&self, a: SetHandle, b: SetHandle) -> SetHandle {
        let (left, right) = {
            let inner = self.inner.lock().expect("store poisoned");
            (
                Self::entry_offsets(&inner, a),
                Self::entry_offsets(&inner, b),
            )
        };

        // Sorted merge with dedup.
        let mut merged = Vec::with_capacity(left.len() + right.len());
        let (mut i, mut j) = (0, 0);
        while i < left.len() && j < right.len() {
            match left[i].cmp(&right[j]) {
                std::cmp::Ordering::Less => {
                    merged.push(left[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(right[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push(left[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&left[i..]);
        merged.extend_from_slice(&right[j..]);

        self.intern(Arc::from(merged.into_boxed_slice()))
    }

    fn protect(&self, h: SetHandle) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner
            .entries
            .get_mut(&h)
            .unwrap_or_else(|| panic!("protect of dead set engine handle {h}"))
            .protect += 1;
    }

    fn unprotect(&self, h: SetHandle) {
        let mut inner = self.inner.lock().expect("store poisoned");
        let entry = inner
            .entries
            .get_mut(&h)
            .unwrap_or_else(|| panic!("unprotect of dead set engine handle {h}"));
        assert!(entry.protect > 0, "unbalanced unprotect of handle {h}");
        entry.protect -= 1;
    }

    fn offsets(&self, h: SetHandle) -> Vec<u32> {
        if h == NO_SET {
            return Vec::new();
        }
        let inner = self.inner.lock().expect("store poisoned");
        Self::entry_offsets(&inner, h).to_vec()
    }

    fn approx_size(&self, h: SetHandle) -> u64 {
        let inner = self.inner.lock().expect("store poisoned");
        inner.entries.get(&h).map_or(0, |e| e.offsets.len() as u64)
    }

    fn needs_collect(&self) -> bool {
        self.len.load(Ordering::Relaxed) > self.high_watermark
    }

    fn collect(&self) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.entries.retain(|_, e| e.protect > 0);
        let rebuilt: HashMap<Arc<[u32]>, SetHandle, RandomState> = inner
            .entries
            .iter()
            .map(|(&h, e)| (Arc::clone(&e.offsets), h))
            .collect();
        inner.by_set = rebuilt;
        self.len.store(inner.entries.len(), Ordering::Release);
        self.collections.fetch_add(1, Ordering::Relaxed);
    }
}
