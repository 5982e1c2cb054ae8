//! Reference-counted tag handles.
//!
//! A handle is a nullable reference to a [`TagSlot`]. Copying increments
//! the slot's count, moving transfers it, dropping decrements; the null
//! handle is the cleared tag and the identity element for combine. Two
//! handles are equal when they name the same slot or, failing that, when
//! their engine values are equal: the same logical set can transiently
//! live in two slots, and callers must not be able to tell.

use crate::engine::{SetHandle, NO_SET};

use super::slot::TagSlot;

pub struct TagHandle {
    slot: Option<&'static TagSlot>,
}

impl TagHandle {
    /// The cleared tag.
    pub const fn empty() -> Self {
        Self { slot: None }
    }

    /// Wrap a slot whose count already reflects this handle (claim sets it
    /// to one).
    pub(crate) fn from_live_slot(slot: &'static TagSlot) -> Self {
        Self { slot: Some(slot) }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    /// Engine value behind this handle; `NO_SET` for the cleared tag.
    #[inline]
    pub fn engine_value(&self) -> SetHandle {
        self.slot.map_or(NO_SET, |s| s.engine_value())
    }

    #[inline]
    pub(crate) fn slot_ptr(&self) -> Option<*const TagSlot> {
        self.slot.map(|s| s as *const TagSlot)
    }
}

impl Clone for TagHandle {
    fn clone(&self) -> Self {
        if let Some(slot) = self.slot {
            slot.retain();
        }
        Self { slot: self.slot }
    }
}

impl Drop for TagHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.release();
        }
    }
}

impl Default for TagHandle {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for TagHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self.slot, other.slot) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                std::ptr::eq(a, b) || a.engine_value() == b.engine_value()
            }
            _ => false,
        }
    }
}

impl Eq for TagHandle {}

impl std::fmt::Debug for TagHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.slot {
            None => write!(f, "TagHandle(empty)"),
            Some(s) => write!(f, "TagHandle(engine={})", s.engine_value()),
        }
    }
}

/// One-entry combine memo, owned by a producer.
///
/// Advisory only: keys are compared by handle value, so a hit is always
/// the right answer and a miss merely costs a request. Entries hold real
/// handles, keeping their slots live until the cache is overwritten or
/// cleared.
#[derive(Default)]
pub struct CombineCache {
    lhs: TagHandle,
    rhs: TagHandle,
    result: TagHandle,
}

impl CombineCache {
    pub fn lookup(&self, lhs: &TagHandle, rhs: &TagHandle) -> Option<TagHandle> {
        if !self.lhs.is_empty() && self.lhs == *lhs && self.rhs == *rhs {
            Some(self.result.clone())
        } else {
            None
        }
    }

    pub fn store(&mut self, lhs: &TagHandle, rhs: &TagHandle, result: &TagHandle) {
        self.lhs = lhs.clone();
        self.rhs = rhs.clone();
        self.result = result.clone();
    }

    pub fn clear(&mut self) {
        self.lhs = TagHandle::empty();
        self.rhs = TagHandle::empty();
        self.result = TagHandle::empty();
    }
}
