//! Tagged slot references.
//!
//! A list head is a slot index paired with a generation counter, packed
//! into one `u64` so both halves are read and swapped by a single atomic
//! operation:
//!
//! ```text
//!  63                32 31                 0
//! ┌────────────────────┬────────────────────┐
//! │     generation     │     slot index     │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! Every successful update bumps the generation, so a head that was popped
//! and pushed back (same index) still compares unequal to any snapshot
//! taken before. The generation wraps after 2^32 updates.

use std::fmt;

use crate::sync::{AtomicU64, Ordering};

/// Index value meaning "no slot".
pub(crate) const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tagged(u64);

impl Tagged {
    /// An empty list at generation zero.
    pub(crate) const EMPTY: Self = Self::new(NIL, 0);

    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    #[inline]
    pub(crate) const fn index(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub(crate) const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub(crate) const fn is_nil(self) -> bool {
        self.index() == NIL
    }

    /// The head that replaces `self` when `index` becomes the first slot.
    #[inline]
    pub(crate) const fn advance(self, index: u32) -> Self {
        Self::new(index, self.generation().wrapping_add(1))
    }
}

impl fmt::Debug for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Tagged");
        if self.is_nil() {
            s.field("index", &"nil");
        } else {
            s.field("index", &self.index());
        }
        s.field("generation", &self.generation()).finish()
    }
}

/// An atomically updated [`Tagged`] value.
pub(crate) struct AtomicTagged(AtomicU64);

impl AtomicTagged {
    pub(crate) fn new(value: Tagged) -> Self {
        Self(AtomicU64::new(value.0))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> Tagged {
        Tagged(self.0.load(order))
    }

    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: Tagged,
        new: Tagged,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Tagged, Tagged> {
        self.0
            .compare_exchange(current.0, new.0, success, failure)
            .map(Tagged)
            .map_err(Tagged)
    }
}

impl fmt::Debug for AtomicTagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}
