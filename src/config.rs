//! Runtime configuration.
//!
//! All knobs are fixed at startup. Defaults match the workload the system
//! was tuned for (fuzzing-style byte provenance over inputs up to 16 MiB);
//! profile before changing them.

/// Startup configuration for [`TagSystem`](crate::TagSystem).
///
/// | Knob | Governs |
/// |------|---------|
/// | `tag_width` | Maximum tracked byte offset (`offset < 2^tag_width`) |
/// | `engine_memory_limit` | Soft ceiling for the set engine's store |
/// | `max_producers` | Producer threads, and thus dedicated workers |
/// | `helper_threads` | Extra gated steal-loop threads (0 disables the tier) |
/// | `deque_size` | Task slots per worker deque |
/// | `block_size` | Tag slots per block, and free-ring capacity |
/// | `max_blocks` | Hard ceiling on arena growth |
/// | `grow_threshold` | Unrecovered slots after a sweep that trigger growth |
/// | `parallel_combine_threshold` | Operand size above which helpers are woken |
/// | `steal_streak` | Upper bound on the sequential-victim walk length |
/// | `seed` | Master seed for per-worker victim-selection RNGs |
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Bits of byte-offset space. 24 covers 16 MiB inputs.
    pub tag_width: u32,
    /// Soft memory ceiling for the set engine, in bytes.
    pub engine_memory_limit: usize,
    /// Maximum number of concurrently registered producer threads.
    pub max_producers: usize,
    /// Helper steal-loop threads woken for large combines and frames.
    pub helper_threads: usize,
    /// Task slots per worker deque. Overflow is fatal.
    pub deque_size: usize,
    /// Tag slots per arena block. Also the free-ring capacity.
    pub block_size: usize,
    /// Maximum number of arena blocks before exhaustion is fatal.
    pub max_blocks: usize,
    /// If a full sweep leaves more than this many ring slots unfilled,
    /// one new block is appended.
    pub grow_threshold: usize,
    /// Estimated operand node count above which a combine opens the
    /// helper gate. Only meaningful with `helper_threads > 0`.
    pub parallel_combine_threshold: u64,
    /// A worker walks up to this many sequential victims before picking
    /// a fresh random one.
    pub steal_streak: u32,
    /// Master seed; each worker forks a private stream from it.
    pub seed: u64,
}

impl Config {
    /// Validate the configuration. Panics on invalid values; a bad
    /// configuration is a deployment error, not a runtime condition.
    pub fn validate(&self) {
        assert!(self.tag_width > 0 && self.tag_width <= 32, "tag_width must be in 1..=32");
        assert!(self.engine_memory_limit > 0, "engine_memory_limit must be > 0");
        assert!(self.max_producers > 0, "max_producers must be > 0");
        assert!(self.deque_size >= 8, "deque_size must be >= 8");
        assert!(self.block_size >= 2, "block_size must be >= 2");
        assert!(self.max_blocks > 0, "max_blocks must be > 0");
        assert!(
            self.grow_threshold < self.block_size,
            "grow_threshold must be < block_size"
        );
        assert!(self.steal_streak > 0, "steal_streak must be > 0");
    }

    /// Total worker-table capacity: one dedicated worker per producer plus
    /// the helper pool.
    pub(crate) fn max_workers(&self) -> usize {
        self.max_producers + self.helper_threads
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tag_width: 24,
            engine_memory_limit: 512 * 1024 * 1024,
            max_producers: 128,
            // No helpers until heavy combines are identifiable up front.
            helper_threads: 0,
            deque_size: 100_000,
            block_size: 0x10000,
            max_blocks: 1024,
            grow_threshold: 0x10000 / 2,
            parallel_combine_threshold: 4096,
            steal_streak: 40,
            seed: 0x853c_49e6_748f_ea9b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate();
    }

    #[test]
    #[should_panic(expected = "grow_threshold")]
    fn threshold_above_block_size_rejected() {
        let cfg = Config {
            block_size: 64,
            grow_threshold: 64,
            ..Config::default()
        };
        cfg.validate();
    }

    #[test]
    #[should_panic(expected = "tag_width")]
    fn zero_tag_width_rejected() {
        let cfg = Config {
            tag_width: 0,
            ..Config::default()
        };
        cfg.validate();
    }
}
