//! Frame publication slot and external mailbox.
//!
//! Both are single-slot broadcast cells. The orchestration that uses them
//! (copy barrier, new-frame save/restore, mailbox pickup) lives in the
//! scheduler, which owns the worker context.

use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use super::task::TaskKind;

/// CAS-published pointer to the frame task every worker must join.
///
/// The pointee lives on the publishing worker's stack; the copy barrier
/// guarantees all workers copy it before the publisher clears the slot and
/// moves on.
pub struct FrameSlot {
    pending: AtomicPtr<TaskKind>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            pending: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Try to become the frame publisher. Fails when another frame is
    /// already pending; the caller must join that one first.
    pub fn try_publish(&self, task: *const TaskKind) -> bool {
        self.pending
            .compare_exchange(
                std::ptr::null_mut(),
                task as *mut TaskKind,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Pending frame task, or null.
    #[inline]
    pub fn pending(&self) -> *const TaskKind {
        self.pending.load(Ordering::Acquire)
    }

    /// Publisher-only: clear after the copy barrier.
    pub fn clear(&self) {
        self.pending.store(std::ptr::null_mut(), Ordering::Release);
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// One externally injected task, waiting on the submitter's stack.
pub struct ExternalCell {
    pub task: TaskKind,
    /// 1 while unexecuted; the executing worker clears it.
    pub spin: AtomicU32,
}

/// Single-slot mailbox for non-worker threads.
///
/// Submission CAS-publishes a stack cell and spins on its flag; some
/// worker's steal loop swaps the slot empty, runs the task, and clears the
/// flag. Serialized by construction: at most one external task is in
/// flight, later submitters spin on the CAS.
pub struct ExternalMailbox {
    pending: AtomicPtr<ExternalCell>,
}

impl ExternalMailbox {
    pub fn new() -> Self {
        Self {
            pending: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.load(Ordering::Acquire).is_null()
    }

    /// Submit `task` and block until a worker has executed it.
    ///
    /// Requires at least one worker running a steal loop; otherwise this
    /// spins forever, exactly like the system it models.
    pub fn run(&self, task: TaskKind) {
        let cell = ExternalCell {
            task,
            spin: AtomicU32::new(1),
        };
        let ptr = &cell as *const ExternalCell as *mut ExternalCell;
        while self
            .pending
            .compare_exchange(std::ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let mut spins = 0u32;
        while cell.spin.load(Ordering::Acquire) != 0 {
            spins = spins.wrapping_add(1);
            if spins & 0x3F == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Worker-side pickup. The returned pointer stays valid until the
    /// caller clears the cell's spin flag, because the submitter is
    /// blocked on it.
    pub fn take(&self) -> Option<*const ExternalCell> {
        if self.pending.load(Ordering::Relaxed).is_null() {
            return None;
        }
        let ptr = self
            .pending
            .swap(std::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }
}

impl Default for ExternalMailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn mailbox_delivers_exactly_once() {
        let mailbox = Arc::new(ExternalMailbox::new());
        let hits = Arc::new(AtomicU64::new(0));

        // A stand-in worker loop.
        let mb = Arc::clone(&mailbox);
        let stop = Arc::new(AtomicU32::new(0));
        let stop2 = Arc::clone(&stop);
        let worker = std::thread::spawn(move || {
            while stop2.load(Ordering::Acquire) == 0 {
                if let Some(cell) = mb.take() {
                    // SAFETY: the submitter blocks until we clear spin.
                    let cell = unsafe { &*cell };
                    match cell.task {
                        TaskKind::Probe { hits } => {
                            unsafe { &*hits }.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => unreachable!(),
                    }
                    cell.spin.store(0, Ordering::Release);
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        for _ in 0..100 {
            mailbox.run(TaskKind::Probe {
                hits: hits.as_ref(),
            });
        }
        assert_eq!(hits.load(Ordering::Relaxed), 100);

        stop.store(1, Ordering::Release);
        worker.join().unwrap();
        assert!(mailbox.is_empty());
    }
}
