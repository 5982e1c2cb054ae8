//! Runtime counters, merged after the fact.

use crate::sched::SchedulerStats;

use super::arena::ArenaSnapshot;

/// Per-producer counters. Plain integers: each producer owns its own.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProducerStats {
    pub allocations: u64,
    pub combines: u64,
    pub cache_lookups: u64,
    pub cache_hits: u64,
}

/// Final system snapshot returned by shutdown.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemStats {
    pub scheduler: SchedulerStats,
    pub arena: ArenaSnapshot,
}
