//! Set engine boundary.
//!
//! The engine hands out opaque handles to immutable, canonicalized sets of
//! byte offsets and supports boolean combination over them. Everything
//! behind the trait is a black box to the rest of the runtime; the only
//! contract that matters is at this seam:
//!
//! - handles are plain `u64`s, `NO_SET` (0) is reserved for "no value";
//! - equal sets are represented by equal handles (canonicalization), which
//!   is what makes structural sharing and handle equality work upstream;
//! - `protect`/`unprotect` root a handle against the engine's own
//!   collector; counts nest;
//! - `collect` is invoked only at a global safe point (inside a frame, all
//!   other workers parked in their steal loops).
//!
//! The engine is mutated only from request-slot handlers: one dedicated
//! worker per producer, one request at a time.

mod store;

pub use store::CanonicalStore;

/// Opaque engine handle. Zero is reserved.
pub type SetHandle = u64;

/// The absent value; identity element for combine at the tag layer.
pub const NO_SET: SetHandle = 0;

pub trait SetEngine: Send + Sync {
    /// Build the singleton set `{offset}`. Never returns `NO_SET`.
    fn singleton(&self, offset: u32) -> SetHandle;

    /// Set union of two live handles.
    ///
    /// Because representation is canonical, the result handle equals one of
    /// the operands whenever the union does.
    fn combine(&self, a: SetHandle, b: SetHandle) -> SetHandle;

    /// Root `h` against engine collection. Counts nest.
    fn protect(&self, h: SetHandle);

    /// Drop one root count for `h`.
    ///
    /// Panics if `h` is not protected: an unbalanced release means a
    /// broken ownership invariant upstream.
    fn unprotect(&self, h: SetHandle);

    /// The offsets in `h`, ascending. Printing and diagnostics only.
    fn offsets(&self, h: SetHandle) -> Vec<u32>;

    /// Cheap size estimate used to gate the helper fan-out tier.
    fn approx_size(&self, h: SetHandle) -> u64;

    /// True when the store is over its memory watermark and a collection
    /// should be scheduled.
    fn needs_collect(&self) -> bool;

    /// Reclaim every unprotected entry. Caller guarantees a safe point.
    fn collect(&self);
}
