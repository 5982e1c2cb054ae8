//! Small, self-contained data structures used across the runtime.

pub mod free_ring;

pub use free_ring::{FreeRing, Refill};
