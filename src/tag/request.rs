//! Synchronous cross-thread request slot.
//!
//! One slot per producer thread, written by exactly two parties in strict
//! turns: the producer owns it while `opcode` is idle, the dedicated
//! worker owns it while an opcode is pending. No queueing: a producer
//! never issues a second request before the first completes.
//!
//! # Ordering
//!
//! ```text
//! producer: store args (Relaxed), store opcode (Release)
//!           -> worker: load opcode (Acquire), load args
//! worker:   store res (Relaxed), store opcode=IDLE (Release)
//!           -> producer: load opcode==IDLE (Acquire), load res
//! ```
//!
//! Result handles cross this slot carrying one transferred engine
//! protection count, taken by the worker before publication; the producer
//! keeps it as the new slot's root or releases it on a structural-sharing
//! hit.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const OP_IDLE: u32 = 0;
pub const OP_ALLOCATE_SET: u32 = 1;
pub const OP_COMBINE_SETS: u32 = 2;

/// A pending request, as seen by the dedicated worker.
#[derive(Clone, Copy, Debug)]
pub struct Request {
    pub opcode: u32,
    pub arg1: u64,
    pub arg2: u64,
}

pub struct RequestSlot {
    opcode: AtomicU32,
    arg1: AtomicU64,
    arg2: AtomicU64,
    res: AtomicU64,
}

impl RequestSlot {
    pub fn new() -> Self {
        Self {
            opcode: AtomicU32::new(OP_IDLE),
            arg1: AtomicU64::new(0),
            arg2: AtomicU64::new(0),
            res: AtomicU64::new(0),
        }
    }

    /// Producer side: publish a request and spin until the worker
    /// completes it. Returns the result word.
    pub fn submit(&self, opcode: u32, arg1: u64, arg2: u64) -> u64 {
        debug_assert_ne!(opcode, OP_IDLE);
        debug_assert_eq!(self.opcode.load(Ordering::Relaxed), OP_IDLE);
        self.arg1.store(arg1, Ordering::Relaxed);
        self.arg2.store(arg2, Ordering::Relaxed);
        self.opcode.store(opcode, Ordering::Release);

        let mut spins = 0u32;
        while self.opcode.load(Ordering::Acquire) != OP_IDLE {
            spins = spins.wrapping_add(1);
            if spins & 0xFFF == 0 {
                // The partner worker may be parked in a frame; do not
                // monopolize the core meanwhile.
                #[cfg(not(loom))]
                std::thread::yield_now();
                #[cfg(loom)]
                loom::thread::yield_now();
            } else {
                #[cfg(not(loom))]
                std::hint::spin_loop();
                #[cfg(loom)]
                loom::thread::yield_now();
            }
        }
        self.res.load(Ordering::Relaxed)
    }

    /// Worker side: pending request, if any.
    pub fn poll(&self) -> Option<Request> {
        let opcode = self.opcode.load(Ordering::Acquire);
        if opcode == OP_IDLE {
            return None;
        }
        Some(Request {
            opcode,
            arg1: self.arg1.load(Ordering::Relaxed),
            arg2: self.arg2.load(Ordering::Relaxed),
        })
    }

    /// Worker side: publish the result and hand the slot back.
    pub fn finish(&self, res: u64) {
        self.res.store(res, Ordering::Relaxed);
        self.opcode.store(OP_IDLE, Ordering::Release);
    }
}

impl Default for RequestSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the runtime shares per producer: the request slot, the quit
/// handshake, and the registration flag.
pub struct ProducerSlot {
    pub request: RequestSlot,
    /// Producer sets 1; its dedicated worker acknowledges by storing 0
    /// after winning the exit lock.
    pub quit: AtomicU32,
    /// Guards double registration of a producer id.
    pub active: AtomicU32,
}

impl ProducerSlot {
    pub fn new() -> Self {
        Self {
            request: RequestSlot::new(),
            quit: AtomicU32::new(0),
            active: AtomicU32::new(0),
        }
    }
}

impl Default for ProducerSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn poll_idle_slot_returns_none() {
        let slot = RequestSlot::new();
        assert!(slot.poll().is_none());
    }

    /// A worker thread services a stream of requests; every response must
    /// match its request.
    #[test]
    fn request_response_turns() {
        let slot = Arc::new(RequestSlot::new());
        let quit = Arc::new(AtomicU32::new(0));

        let s = Arc::clone(&slot);
        let q = Arc::clone(&quit);
        let worker = std::thread::spawn(move || {
            while q.load(Ordering::Acquire) == 0 {
                if let Some(req) = s.poll() {
                    let res = match req.opcode {
                        OP_ALLOCATE_SET => req.arg1 + 1,
                        OP_COMBINE_SETS => req.arg1 * req.arg2,
                        other => panic!("bad opcode {other}"),
                    };
                    s.finish(res);
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        for i in 0..10_000u64 {
            assert_eq!(slot.submit(OP_ALLOCATE_SET, i, 0), i + 1);
            assert_eq!(slot.submit(OP_COMBINE_SETS, i, 3), i * 3);
        }

        quit.store(1, Ordering::Release);
        worker.join().unwrap();
    }
}
