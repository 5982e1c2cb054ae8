//! Scheduler observability.
//!
//! Hot-path updates are plain integer ops on worker-owned structs; workers
//! hand their counters back on exit and the scheduler merges them after
//! join, so nothing on the steal path touches shared cache lines.

/// Per-worker counters. Owned by the worker thread; no atomics.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerMetrics {
    pub steal_attempts: u64,
    pub steal_successes: u64,
    pub requests_served: u64,
    pub frames_joined: u64,
    pub externals_run: u64,
}

/// Merged view of every exited worker.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerStats {
    pub workers: u64,
    pub steal_attempts: u64,
    pub steal_successes: u64,
    pub requests_served: u64,
    pub frames_joined: u64,
    pub externals_run: u64,
}

impl SchedulerStats {
    pub fn merge_worker(&mut self, m: &WorkerMetrics) {
        self.workers += 1;
        self.steal_attempts += m.steal_attempts;
        self.steal_successes += m.steal_successes;
        self.requests_served += m.requests_served;
        self.frames_joined += m.frames_joined;
        self.externals_run += m.externals_run;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates() {
        let mut snap = SchedulerStats::default();
        let a = WorkerMetrics {
            steal_attempts: 5,
            steal_successes: 2,
            ..Default::default()
        };
        let b = WorkerMetrics {
            steal_attempts: 3,
            frames_joined: 1,
            ..Default::default()
        };
        snap.merge_worker(&a);
        snap.merge_worker(&b);
        assert_eq!(snap.workers, 2);
        assert_eq!(snap.steal_attempts, 8);
        assert_eq!(snap.steal_successes, 2);
        assert_eq!(snap.frames_joined, 1);
    }
}
