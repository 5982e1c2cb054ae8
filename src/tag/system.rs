//! System facade: lifecycle, producers, and the tag operations.
//!
//! The host instrumentation framework drives this surface: bring the
//! system up, register one producer per analysis thread, allocate and
//! combine tags on the hot path, format tags for reports, tear everything
//! down. Every call except `format` and the audits is producer-keyed.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::config::Config;
use crate::engine::{CanonicalStore, SetEngine};
use crate::sched::{Scheduler, TaskKind, WorkerCtx};

use super::arena::{ArenaSnapshot, AuditReport, SlotCensus, TagArena};
use super::handle::{CombineCache, TagHandle};
use super::request::{ProducerSlot, OP_ALLOCATE_SET, OP_COMBINE_SETS};
use super::stats::{ProducerStats, SystemStats};

struct SystemInner {
    cfg: Config,
    engine: Arc<dyn SetEngine>,
    sched: Arc<Scheduler>,
    arena: TagArena,
    producers: Box<[CachePadded<ProducerSlot>]>,
    active_producers: AtomicU32,
}

pub struct TagSystem {
    inner: Arc<SystemInner>,
    stopped: bool,
}

impl TagSystem {
    /// Bring the subsystem up with the default canonical set engine.
    pub fn start(cfg: Config) -> Self {
        let engine = Arc::new(CanonicalStore::new(cfg.engine_memory_limit));
        Self::with_engine(cfg, engine)
    }

    /// Bring the subsystem up over a caller-provided engine.
    pub fn with_engine(cfg: Config, engine: Arc<dyn SetEngine>) -> Self {
        cfg.validate();
        let sched = Scheduler::start(cfg, Arc::clone(&engine));
        let arena = TagArena::new(&cfg, Arc::clone(&engine));
        let producers = (0..cfg.max_producers)
            .map(|_| CachePadded::new(ProducerSlot::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(SystemInner {
                cfg,
                engine,
                sched,
                arena,
                producers,
                active_producers: AtomicU32::new(0),
            }),
            stopped: false,
        }
    }

    /// Register a producer thread and spawn its dedicated worker. The
    /// first registration also brings up the helper pool.
    ///
    /// Double-starting an id is a fatal protocol violation.
    pub fn producer_start(&self, producer_id: usize) -> Producer {
        let inner = &self.inner;
        assert!(
            producer_id < inner.cfg.max_producers,
            "producer id {producer_id} out of range"
        );
        let slot = &inner.producers[producer_id];
        assert_eq!(
            slot.active.swap(1, Ordering::AcqRel),
            0,
            "producer {producer_id} started twice"
        );
        slot.quit.store(0, Ordering::Release);
        inner.active_producers.fetch_add(1, Ordering::AcqRel);

        let sys = Arc::clone(inner);
        let ack = Arc::clone(inner);
        inner.sched.spawn_dedicated(
            move |ctx| service(&sys, producer_id, ctx),
            move || ack.producers[producer_id].quit.store(0, Ordering::Release),
        );

        Producer {
            sys: Arc::clone(inner),
            index: producer_id,
            cache: CombineCache::default(),
            stats: ProducerStats::default(),
            stopped: false,
        }
    }

    /// Render the byte-offset set behind `tag` as sorted, half-open,
    /// merged intervals: offsets {0,1,2,7} print as `{(0, 3) (7, 8)}`,
    /// the cleared tag as `{}`.
    pub fn format(&self, tag: &TagHandle) -> String {
        if tag.is_empty() {
            return "{}".to_owned();
        }
        let offsets = self.inner.engine.offsets(tag.engine_value());
        debug_assert!(offsets.windows(2).all(|w| w[0] < w[1]));

        let mut out = String::from("{");
        let mut i = 0;
        while i < offsets.len() {
            let start = offsets[i];
            let mut end = start + 1;
            while i + 1 < offsets.len() && offsets[i + 1] == end {
                i += 1;
                end += 1;
            }
            if out.len() > 1 {
                out.push(' ');
            }
            out.push_str(&format!("({start}, {end})"));
            i += 1;
        }
        out.push('}');
        out
    }

    /// Check every live slot's count against the given roots.
    pub fn audit<'a, I>(&self, roots: I) -> AuditReport
    where
        I: IntoIterator<Item = &'a TagHandle>,
    {
        self.inner.arena.audit(roots)
    }

    pub fn census(&self) -> SlotCensus {
        self.inner.arena.census()
    }

    pub fn arena_snapshot(&self) -> ArenaSnapshot {
        self.inner.arena.snapshot()
    }

    pub fn engine(&self) -> &Arc<dyn SetEngine> {
        &self.inner.engine
    }

    /// Tear the subsystem down. All producers must have stopped.
    pub fn shutdown(mut self) -> SystemStats {
        self.stopped = true;
        assert_eq!(
            self.inner.active_producers.load(Ordering::Acquire),
            0,
            "shutdown with active producers"
        );
        self.inner.sched.stop();
        SystemStats {
            scheduler: self.inner.sched.stats(),
            arena: self.inner.arena.snapshot(),
        }
    }
}

impl Drop for TagSystem {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        if self.inner.active_producers.load(Ordering::Acquire) == 0 {
            self.inner.sched.stop();
        } else {
            // Cannot safely join workers whose producers are still live;
            // leak them rather than deadlock in drop.
            eprintln!("WARN: TagSystem dropped with active producers; workers leaked");
        }
    }
}

/// Dedicated-worker service: one request slot poll per loop iteration.
fn service(sys: &Arc<SystemInner>, index: usize, ctx: &mut WorkerCtx) -> ControlFlow<()> {
    let slot = &sys.producers[index];
    if slot.quit.load(Ordering::Acquire) != 0 {
        return ControlFlow::Break(());
    }
    if let Some(req) = slot.request.poll() {
        let res = match req.opcode {
            OP_ALLOCATE_SET => sys.engine.singleton(req.arg1 as u32),
            OP_COMBINE_SETS => {
                let threshold = sys.cfg.parallel_combine_threshold;
                if sys.cfg.helper_threads > 0
                    && sys.engine.approx_size(req.arg1) > threshold
                    && sys.engine.approx_size(req.arg2) > threshold
                {
                    // Fan-out tier: wake helpers for the duration. They
                    // only steal deque work; this worker remains the sole
                    // writer of the request slot.
                    sys.sched.with_helpers(|| sys.engine.combine(req.arg1, req.arg2))
                } else {
                    sys.engine.combine(req.arg1, req.arg2)
                }
            }
            other => panic!("invalid request opcode {other}"),
        };
        // Transit protection: the result must survive any engine
        // collection until the producer roots or discards it.
        sys.engine.protect(res);
        if sys.engine.needs_collect() {
            sys.sched.run_new_frame(ctx, TaskKind::EngineCollect);
        }
        slot.request.finish(res);
        ctx.metrics.requests_served += 1;
    }
    ControlFlow::Continue(())
}

/// A registered producer thread's handle onto the tag system.
///
/// Owns the thread's combine cache, so cache locality is structural: the
/// value is not `Clone`, and moving it moves the cache with it.
pub struct Producer {
    sys: Arc<SystemInner>,
    index: usize,
    cache: CombineCache,
    stats: ProducerStats,
    stopped: bool,
}

impl Producer {
    pub fn id(&self) -> usize {
        self.index
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats
    }

    /// Allocate a tag for one byte offset.
    pub fn allocate(&mut self, offset: u32) -> TagHandle {
        assert!(
            (offset as u64) < (1u64 << self.sys.cfg.tag_width),
            "offset {offset} exceeds the configured tag width"
        );
        let slot = self.sys.arena.claim();
        let res = self.sys.producers[self.index].request.submit(
            OP_ALLOCATE_SET,
            offset as u64,
            0,
        );
        // The request's transit protection becomes this slot's root.
        slot.set_engine_value(res);
        self.stats.allocations += 1;
        TagHandle::from_live_slot(slot)
    }

    /// Combine two tags into their set union.
    pub fn combine(&mut self, lhs: &TagHandle, rhs: &TagHandle) -> TagHandle {
        if lhs.is_empty() {
            return rhs.clone();
        }
        if rhs.is_empty() || lhs == rhs {
            return lhs.clone();
        }

        self.stats.cache_lookups += 1;
        if let Some(hit) = self.cache.lookup(lhs, rhs) {
            self.stats.cache_hits += 1;
            return hit;
        }

        let a = lhs.engine_value();
        let b = rhs.engine_value();
        let res = self.sys.producers[self.index]
            .request
            .submit(OP_COMBINE_SETS, a, b);
        self.stats.combines += 1;

        let result = if res == a {
            // Structural sharing: the union is lhs itself. No slot is
            // consumed, and the transit protection is surplus.
            self.sys.engine.unprotect(res);
            lhs.clone()
        } else if res == b {
            self.sys.engine.unprotect(res);
            rhs.clone()
        } else {
            let slot = self.sys.arena.claim();
            slot.set_engine_value(res);
            TagHandle::from_live_slot(slot)
        };

        self.cache.store(lhs, rhs, &result);
        result
    }

    /// Stop this producer: signal the dedicated worker, wait for its
    /// acknowledgement, drop the combine cache.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let slot = &self.sys.producers[self.index];
        slot.quit.store(1, Ordering::Release);
        while slot.quit.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
        self.cache.clear();
        slot.active.store(0, Ordering::Release);
        self.sys.active_producers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
