//! Tag lifecycle: slots, handles, the allocator/collector, and the
//! producer-facing facade.

pub mod arena;
pub mod handle;
pub mod request;
pub mod slot;
pub mod stats;
pub mod system;

pub use arena::{ArenaSnapshot, AuditReport, SlotCensus, TagArena};
pub use handle::{CombineCache, TagHandle};
pub use request::{ProducerSlot, Request, RequestSlot, OP_ALLOCATE_SET, OP_COMBINE_SETS, OP_IDLE};
pub use slot::{SlotState, TagSlot, REFS_NEVER_USED, REFS_QUEUED};
pub use stats::{ProducerStats, SystemStats};
pub use system::{Producer, TagSystem};
