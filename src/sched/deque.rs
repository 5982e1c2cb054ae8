//! Split-window work-stealing deque.
//!
//! # Design
//!
//! A fixed-capacity task array with three regions:
//!
//! ```text
//!   0        tail          split         head       capacity
//!   |  done/empty | stealable (shared) | private |  unused  |
//! ```
//!
//! The owner pushes and pops at `head` with no synchronization in the
//! common case. Thieves take the *oldest* stealable task by CAS-advancing
//! `tail` inside a packed `(tail, split)` word, so a task is delivered
//! exactly once: an index is consumed either by a tail increment (one
//! winning thief) or by the owner CAS-lowering `split` to reclaim it, and
//! both contend on the same word.
//!
//! The shared window moves lazily. Thieves that find it empty raise
//! `move_split`; the owner honors the request on its next push by growing
//! `split` toward `head`. When everything is stolen the owner flags
//! `all_stolen`, and the next push republishes a one-task window.
//!
//! There is no wraparound: the array is sized for bursty, usually-shallow
//! nesting, and running off the end is fatal.
//!
//! # Slot lifecycle
//!
//! Each slot carries a `thief` word: `EMPTY -> TASK` on push, `-> <thief
//! id>` when a thief claims it, `-> COMPLETED` when the thief finishes,
//! `-> EMPTY` when the owner pops or reaps it. [`SharedDeque::find_head`]
//! locates the first `EMPTY` slot with a linear probe of the first four
//! slots, then exponential doubling, then binary search: nesting is
//! usually shallow, but deep recursion must not degrade to O(n).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use super::task::TaskKind;

pub const THIEF_EMPTY: u64 = 0;
pub const THIEF_TASK: u64 = 1;
pub const THIEF_COMPLETED: u64 = 2;
/// Stolen-by marker: `THIEF_BASE + worker_id`.
pub const THIEF_BASE: u64 = 16;

#[inline]
fn pack(tail: u32, split: u32) -> u64 {
    ((tail as u64) << 32) | split as u64
}

#[inline]
fn unpack(ts: u64) -> (u32, u32) {
    ((ts >> 32) as u32, ts as u32)
}

struct TaskCell {
    thief: AtomicU64,
    task: UnsafeCell<TaskKind>,
}

// SAFETY: `task` is written by the owner only while the slot is outside
// the shared window (or before the window covering it is published), and
// read by at most one thief, which first won the `(tail, split)` CAS. The
// Release publication of the window orders the write before any steal.
unsafe impl Sync for TaskCell {}

/// Shared side of one worker's deque. Thieves interact only with this.
pub struct SharedDeque {
    /// Packed `(tail << 32) | split`.
    ts: CachePadded<AtomicU64>,
    /// Owner has observed that every pushed task was stolen.
    all_stolen: CachePadded<AtomicU32>,
    /// Thief request: grow the shared window.
    move_split: AtomicU32,
    /// Guards against two `owner()` calls.
    owner_claimed: AtomicU32,
    slots: Box<[TaskCell]>,
}

/// Result of one steal attempt.
pub enum StealOutcome {
    /// Nothing stealable.
    Empty,
    /// Lost the CAS to another thief or the owner; worth retrying.
    Lost,
    /// Task claimed. Run it, then call [`SharedDeque::complete`].
    Stolen { task: TaskKind, index: usize },
}

/// Result of one owner pop.
pub enum Pop {
    /// Deque is empty.
    Empty,
    /// Newest task was still private; caller executes it.
    Local(TaskKind),
    /// Newest task had been stolen; its completion has been awaited and the
    /// slot reclaimed.
    Stolen,
}

impl SharedDeque {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 8, "deque capacity must be >= 8");
        assert!(capacity < u32::MAX as usize, "deque capacity must fit in u32");
        let slots = (0..capacity)
            .map(|_| TaskCell {
                thief: AtomicU64::new(THIEF_EMPTY),
                task: UnsafeCell::new(TaskKind::Nop),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            ts: CachePadded::new(AtomicU64::new(pack(0, 0))),
            all_stolen: CachePadded::new(AtomicU32::new(0)),
            move_split: AtomicU32::new(0),
            owner_claimed: AtomicU32::new(0),
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the owner side. Exactly one owner per deque; a second claim is
    /// a lifecycle bug and fatal.
    pub fn owner(&'static self) -> DequeOwner {
        assert!(
            self.owner_claimed.swap(1, Ordering::AcqRel) == 0,
            "deque already has an owner"
        );
        let head = self.find_head();
        let (_, split) = unpack(self.ts.load(Ordering::Acquire));
        DequeOwner {
            shared: self,
            head,
            split: split as usize,
            all_stolen: self.all_stolen.load(Ordering::Acquire) != 0,
        }
    }

    /// Find the first `EMPTY` slot: linear probe of the first four, then
    /// power-of-two doubling to bracket, then binary search.
    pub fn find_head(&self) -> usize {
        let dq = &self.slots;

        for (i, cell) in dq.iter().enumerate().take(4) {
            if cell.thief.load(Ordering::Acquire) == THIEF_EMPTY {
                return i;
            }
        }

        let mut low = 2usize;
        let mut high = dq.len();
        loop {
            if low * 2 >= high {
                break;
            } else if dq[low * 2].thief.load(Ordering::Acquire) == THIEF_EMPTY {
                high = low * 2;
                break;
            } else {
                low *= 2;
            }
        }

        while low < high {
            let mid = low + (high - low) / 2;
            if dq[mid].thief.load(Ordering::Acquire) == THIEF_EMPTY {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        low
    }

    /// One steal attempt by worker `thief_id`.
    pub fn try_steal(&self, thief_id: u32) -> StealOutcome {
        if self.all_stolen.load(Ordering::Acquire) != 0 {
            return StealOutcome::Empty;
        }
        let cur = self.ts.load(Ordering::Acquire);
        let (tail, split) = unpack(cur);
        if tail < split {
            match self.ts.compare_exchange(
                cur,
                pack(tail + 1, split),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let cell = &self.slots[tail as usize];
                    // SAFETY: winning the tail CAS grants exclusive read
                    // access to this slot; the owner's write to it was
                    // ordered before the window publication we Acquired.
                    let task = unsafe { *cell.task.get() };
                    cell.thief
                        .store(THIEF_BASE + thief_id as u64, Ordering::Release);
                    StealOutcome::Stolen {
                        task,
                        index: tail as usize,
                    }
                }
                Err(_) => StealOutcome::Lost,
            }
        } else {
            // Empty window: ask the owner to move its split point.
            if self.move_split.load(Ordering::Relaxed) == 0 {
                self.move_split.store(1, Ordering::Relaxed);
            }
            StealOutcome::Empty
        }
    }

    /// Mark a stolen task finished. The owner's sync spins on this.
    pub fn complete(&self, index: usize) {
        self.slots[index].thief.store(THIEF_COMPLETED, Ordering::Release);
    }
}

/// Owner side of a deque. Lives on the owning worker's thread.
pub struct DequeOwner {
    shared: &'static SharedDeque,
    /// Next free slot.
    head: usize,
    /// Cached copy of the shared split.
    split: usize,
    /// Cached copy of the shared all-stolen flag.
    all_stolen: bool,
}

/// Snapshot of the deque window, taken when entering a frame.
pub struct FrameSave {
    ts: u64,
    split: usize,
    all_stolen: bool,
}

impl DequeOwner {
    pub fn shared(&self) -> &'static SharedDeque {
        self.shared
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    /// Push a task. Fatal on overflow: the deque is sized for the
    /// workload, and running past the end means the configuration is wrong.
    pub fn push(&mut self, task: TaskKind) {
        let idx = self.head;
        assert!(idx < self.shared.slots.len(), "task deque overflow");
        let cell = &self.shared.slots[idx];
        debug_assert_eq!(cell.thief.load(Ordering::Relaxed), THIEF_EMPTY);
        // SAFETY: slot `idx` is outside every published window (idx >=
        // split) or, on the all-stolen path, not yet covered by the window
        // published below; the owner is the only writer.
        unsafe {
            *cell.task.get() = task;
        }
        cell.thief.store(THIEF_TASK, Ordering::Release);
        self.head = idx + 1;

        if self.all_stolen {
            // Everything before idx is gone; republish a one-task window.
            self.shared
                .ts
                .store(pack(idx as u32, idx as u32 + 1), Ordering::Release);
            self.shared.all_stolen.store(0, Ordering::Release);
            self.shared.move_split.store(0, Ordering::Relaxed);
            self.split = idx + 1;
            self.all_stolen = false;
        } else if self.shared.move_split.load(Ordering::Relaxed) != 0 {
            self.grow_shared();
        }
    }

    /// Pop the newest task.
    pub fn pop(&mut self) -> Pop {
        if self.head == 0 {
            return Pop::Empty;
        }
        let idx = self.head - 1;

        if !self.all_stolen {
            if self.split < self.head {
                // Private region non-empty: plain local pop.
                self.head = idx;
                let cell = &self.shared.slots[idx];
                // SAFETY: idx >= split, so no thief can claim it, and the
                // owner is the only other accessor.
                let task = unsafe { *cell.task.get() };
                cell.thief.store(THIEF_EMPTY, Ordering::Relaxed);
                return Pop::Local(task);
            }
            if self.shrink_shared() {
                // Regained private slots; take the local path above.
                return self.pop();
            }
            // Thieves got everything.
            self.shared.all_stolen.store(1, Ordering::Release);
            self.all_stolen = true;
        }

        self.wait_stolen(idx);
        self.head = idx;
        Pop::Stolen
    }

    /// Snapshot and neutralize the window so the deque reads as fully
    /// stolen for the duration of a frame.
    pub fn begin_frame(&mut self) -> FrameSave {
        let old_all_stolen = self.all_stolen;
        self.shared.all_stolen.store(1, Ordering::Release);
        let old_ts = self
            .shared
            .ts
            .swap(pack(self.head as u32, self.head as u32), Ordering::AcqRel);
        let save = FrameSave {
            ts: old_ts,
            split: self.split,
            all_stolen: old_all_stolen,
        };
        self.split = self.head;
        self.all_stolen = true;
        save
    }

    /// Restore the pre-frame window.
    pub fn restore_frame(&mut self, save: FrameSave) {
        self.shared
            .all_stolen
            .store(save.all_stolen as u32, Ordering::Release);
        self.shared.ts.store(save.ts, Ordering::Release);
        self.split = save.split;
        self.all_stolen = save.all_stolen;
    }

    /// Grow the shared window to the midpoint between split and head.
    fn grow_shared(&mut self) {
        let new_split = ((self.split + self.head + 1) / 2).min(self.head);
        loop {
            let cur = self.shared.ts.load(Ordering::Acquire);
            let (tail, _) = unpack(cur);
            if self
                .shared
                .ts
                .compare_exchange_weak(
                    cur,
                    pack(tail, new_split as u32),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        self.split = new_split;
        self.shared.move_split.store(0, Ordering::Relaxed);
    }

    /// Try to pull the split back toward tail, reclaiming unstolen shared
    /// tasks. Returns false when thieves have taken everything.
    fn shrink_shared(&mut self) -> bool {
        loop {
            let cur = self.shared.ts.load(Ordering::Acquire);
            let (tail, split) = unpack(cur);
            if tail == split {
                return false;
            }
            let new_split = (tail + split) / 2;
            if self
                .shared
                .ts
                .compare_exchange_weak(
                    cur,
                    pack(tail, new_split),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.split = new_split as usize;
                return true;
            }
        }
    }

    /// Wait for the thief of slot `idx` to finish, then reclaim the slot.
    fn wait_stolen(&mut self, idx: usize) {
        let cell = &self.shared.slots[idx];
        while cell.thief.load(Ordering::Acquire) != THIEF_COMPLETED {
            std::hint::spin_loop();
        }
        cell.thief.store(THIEF_EMPTY, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    fn leaked(capacity: usize) -> &'static SharedDeque {
        Box::leak(Box::new(SharedDeque::new(capacity)))
    }

    fn probe_task(counter: &AtomicU64) -> TaskKind {
        TaskKind::Probe { hits: counter }
    }

    fn run(task: TaskKind) {
        match task {
            TaskKind::Probe { hits } => {
                // SAFETY: test counters outlive the deque operations.
                unsafe { &*hits }.fetch_add(1, Ordering::Relaxed);
            }
            TaskKind::Nop => {}
            other => panic!("unexpected task in deque test: {other:?}"),
        }
    }

    #[test]
    fn local_pop_is_lifo() {
        let dq = leaked(16);
        let mut owner = dq.owner();
        let counters: Vec<AtomicU64> = (0..3).map(|_| AtomicU64::new(0)).collect();

        for c in &counters {
            owner.push(probe_task(c));
        }
        // Newest first.
        for expected in (0..3).rev() {
            match owner.pop() {
                Pop::Local(t) => {
                    run(t);
                    assert_eq!(counters[expected].load(Ordering::Relaxed), 1);
                }
                _ => panic!("expected local pop"),
            }
        }
        assert!(matches!(owner.pop(), Pop::Empty));
    }

    #[test]
    fn steal_takes_oldest_after_split_moves() {
        let dq = leaked(16);
        let mut owner = dq.owner();
        let counters: Vec<AtomicU64> = (0..2).map(|_| AtomicU64::new(0)).collect();

        owner.push(probe_task(&counters[0]));
        // Window starts empty: the first attempt only requests a split move.
        assert!(matches!(dq.try_steal(1), StealOutcome::Empty));
        owner.push(probe_task(&counters[1]));

        match dq.try_steal(1) {
            StealOutcome::Stolen { task, index } => {
                assert_eq!(index, 0, "thief must take the oldest task");
                run(task);
                dq.complete(index);
            }
            _ => panic!("expected steal"),
        }
        assert_eq!(counters[0].load(Ordering::Relaxed), 1);
        assert_eq!(counters[1].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn pop_waits_for_thief_completion() {
        let dq = leaked(16);
        let mut owner = dq.owner();
        let counter = AtomicU64::new(0);

        owner.push(probe_task(&counter));
        assert!(matches!(dq.try_steal(1), StealOutcome::Empty));
        owner.push(TaskKind::Nop);

        // Steal the oldest but delay completion.
        let index = match dq.try_steal(1) {
            StealOutcome::Stolen { index, .. } => index,
            _ => panic!("expected steal"),
        };

        // Pop the private newest task first.
        assert!(matches!(owner.pop(), Pop::Local(TaskKind::Nop)));

        // The remaining slot is stolen; pop must block until completion.
        let done = Arc::new(AtomicBool::new(false));
        std::thread::scope(|s| {
            let done2 = Arc::clone(&done);
            s.spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                done2.store(true, Ordering::Release);
                dq.complete(index);
            });
            match owner.pop() {
                Pop::Stolen => assert!(done.load(Ordering::Acquire)),
                _ => panic!("expected stolen pop"),
            }
        });
        assert!(matches!(owner.pop(), Pop::Empty));
    }

    #[test]
    fn find_head_matches_push_count() {
        let dq = leaked(64);
        let mut owner = dq.owner();
        assert_eq!(dq.find_head(), 0);
        // Exercise the linear, doubling, and binary-search regimes.
        for k in 0..40 {
            owner.push(TaskKind::Nop);
            assert_eq!(dq.find_head(), k + 1);
        }
    }

    #[test]
    fn frame_save_restore_preserves_tasks() {
        let dq = leaked(16);
        let mut owner = dq.owner();
        let counter = AtomicU64::new(0);
        owner.push(probe_task(&counter));
        owner.push(probe_task(&counter));

        let save = owner.begin_frame();
        // Inside the frame the deque reads as fully stolen.
        assert!(matches!(dq.try_steal(1), StealOutcome::Empty));
        owner.restore_frame(save);

        assert!(matches!(owner.pop(), Pop::Local(_)));
        assert!(matches!(owner.pop(), Pop::Local(_)));
        assert!(matches!(owner.pop(), Pop::Empty));
    }

    #[test]
    #[should_panic(expected = "task deque overflow")]
    fn overflow_is_fatal() {
        let dq = leaked(8);
        let mut owner = dq.owner();
        for _ in 0..9 {
            owner.push(TaskKind::Nop);
        }
    }

    /// Owner drains while thieves hammer the deque; every task executes
    /// exactly once.
    #[test]
    fn concurrent_steal_no_double_delivery() {
        const TASKS: usize = 512;
        const THIEVES: usize = 3;

        let dq = leaked(TASKS + 8);
        let counters: Arc<Vec<AtomicU64>> =
            Arc::new((0..TASKS).map(|_| AtomicU64::new(0)).collect());
        let stop = Arc::new(AtomicBool::new(false));

        let mut thieves = Vec::new();
        for id in 0..THIEVES {
            let stop = Arc::clone(&stop);
            thieves.push(std::thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    match dq.try_steal(id as u32 + 1) {
                        StealOutcome::Stolen { task, index } => {
                            run(task);
                            dq.complete(index);
                        }
                        StealOutcome::Lost => {}
                        StealOutcome::Empty => std::hint::spin_loop(),
                    }
                }
            }));
        }

        let mut owner = dq.owner();
        for c in counters.iter() {
            owner.push(probe_task(c));
        }
        loop {
            match owner.pop() {
                Pop::Local(t) => run(t),
                Pop::Stolen => {}
                Pop::Empty => break,
            }
        }
        stop.store(true, Ordering::Release);
        for t in thieves {
            t.join().unwrap();
        }

        for (i, c) in counters.iter().enumerate() {
            assert_eq!(c.load(Ordering::Relaxed), 1, "task {i} delivered wrong count");
        }
    }
}
