//! Type-stable slot storage.
//!
//! Slots live in a fixed table of lazily allocated segments. Segment `k`
//! holds `32 << k` slots, so 27 segments cover every index below
//! [`NIL`]. A segment is never freed or moved while the arena lives: any
//! index a thread ever observed keeps naming valid memory, and a stale read
//! of a slot's `next` link is a read of a live atomic.
//!
//! Slots that are no longer in use sit on a free list, itself a tagged
//! Treiber list threaded through the same `next` links.

use std::mem::MaybeUninit;
use std::ptr;

use crossbeam_utils::CachePadded;

use crate::backoff::{BackoffPolicy, Contention};
use crate::error::Contended;
use crate::sync::{AtomicPtr, AtomicU32, AtomicUsize, Ordering, UnsafeCell};
use crate::tagged::{AtomicTagged, Tagged, NIL};

const FIRST_SHIFT: u32 = 5;
const FIRST_LEN: usize = 1 << FIRST_SHIFT;
const SEGMENTS: usize = 27;

/// Total number of slots an arena can address.
pub const MAX_SLOTS: usize = FIRST_LEN * ((1 << SEGMENTS) - 1);

const _: () = assert!(MAX_SLOTS < NIL as usize);

pub(crate) struct Slot<T> {
    next: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Index of the slot below this one.
    #[inline]
    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// Caller owns the slot and it holds no value.
    #[inline]
    pub(crate) unsafe fn write(&self, value: T) {
        self.value.with_mut(|p| unsafe {
            (*p).write(value);
        });
    }

    /// # Safety
    ///
    /// Caller owns the slot and it holds a value. The slot is empty
    /// afterwards.
    #[inline]
    pub(crate) unsafe fn read(&self) -> T {
        self.value.with_mut(|p| unsafe { (*p).assume_init_read() })
    }

    /// # Safety
    ///
    /// Same as [`read`](Self::read).
    pub(crate) unsafe fn drop_value(&self) {
        self.value.with_mut(|p| unsafe { (*p).assume_init_drop() });
    }
}

/// Segment number and offset of a slot index.
#[inline]
const fn locate(index: u32) -> (usize, usize) {
    let n = index as u64 + FIRST_LEN as u64;
    let segment = (63 - n.leading_zeros() - FIRST_SHIFT) as usize;
    let offset = (n - ((FIRST_LEN as u64) << segment)) as usize;
    (segment, offset)
}

#[inline]
const fn segment_len(segment: usize) -> usize {
    FIRST_LEN << segment
}

pub(crate) struct Arena<T> {
    segments: [AtomicPtr<Slot<T>>; SEGMENTS],
    /// Next never-used index.
    fresh: CachePadded<AtomicUsize>,
    free: CachePadded<AtomicTagged>,
    policy: BackoffPolicy,
}

impl<T> Arena<T> {
    /// Creates an arena with segments covering the first `capacity` slots.
    ///
    /// `capacity` must not exceed [`MAX_SLOTS`].
    pub(crate) fn new(capacity: usize, policy: BackoffPolicy) -> Self {
        debug_assert!(capacity <= MAX_SLOTS);
        let arena = Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            fresh: CachePadded::new(AtomicUsize::new(0)),
            free: CachePadded::new(AtomicTagged::new(Tagged::EMPTY)),
            policy,
        };
        if capacity > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let (last, _) = locate((capacity - 1) as u32);
            for segment in 0..=last {
                arena.segment(segment);
            }
        }
        arena
    }

    /// Returns the slot at `index`.
    ///
    /// `index` must have been handed out by [`acquire`](Self::acquire), or
    /// read from a head or link that was published after it was.
    #[inline]
    pub(crate) fn slot(&self, index: u32) -> &Slot<T> {
        let (segment, offset) = locate(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "slot {index} in unallocated segment");
        // SAFETY: the segment was allocated before `index` was handed out
        // and is not freed until the arena drops. `offset` is within it.
        unsafe { &*base.add(offset) }
    }

    /// Takes an unused slot, growing the arena if the free list is empty.
    ///
    /// # Panics
    ///
    /// Panics if all [`MAX_SLOTS`] slots are live.
    pub(crate) fn acquire(&self) -> u32 {
        let mut contention = Contention::unbounded(self.policy);
        if let Ok(Some(index)) = self.unlink(&self.free, &mut contention) {
            return index;
        }

        let index = self.fresh.fetch_add(1, Ordering::Relaxed);
        assert!(index < MAX_SLOTS, "stack slot index space exhausted");
        #[allow(clippy::cast_possible_truncation)]
        let index = index as u32;
        self.segment(locate(index).0);
        index
    }

    /// Puts a slot whose value has been moved out back on the free list.
    pub(crate) fn release(&self, index: u32) {
        let mut contention = Contention::unbounded(self.policy);
        let released = self.link(&self.free, index, &mut contention);
        debug_assert!(released.is_ok());
    }

    /// Makes `index` the first slot of the list rooted at `head`.
    ///
    /// The caller owns the slot. Publication is a release, so whatever the
    /// caller wrote to the slot is visible to the thread that unlinks it.
    pub(crate) fn link(
        &self,
        head: &AtomicTagged,
        index: u32,
        contention: &mut Contention,
    ) -> Result<(), Contended> {
        let slot = self.slot(index);
        let mut current = head.load(Ordering::Relaxed);
        loop {
            slot.next.store(current.index(), Ordering::Relaxed);
            match head.compare_exchange(
                current,
                current.advance(index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => {
                    current = actual;
                    contention.failed()?;
                }
            }
        }
    }

    /// Detaches the first slot of the list rooted at `head`.
    ///
    /// On success the caller owns the returned slot.
    pub(crate) fn unlink(
        &self,
        head: &AtomicTagged,
        contention: &mut Contention,
    ) -> Result<Option<u32>, Contended> {
        let mut current = head.load(Ordering::Acquire);
        loop {
            if current.is_nil() {
                return Ok(None);
            }
            // May be stale if another thread got here first; the exchange
            // below then fails on the generation.
            let next = self.slot(current.index()).next();
            match head.compare_exchange(
                current,
                current.advance(next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(Some(current.index())),
                Err(actual) => {
                    current = actual;
                    contention.failed()?;
                }
            }
        }
    }

    /// Slots backed by allocated segments.
    pub(crate) fn allocated(&self) -> usize {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.load(Ordering::Acquire).is_null())
            .map(|(k, _)| segment_len(k))
            .sum()
    }

    /// Base pointer of `segment`, allocating it on first use.
    #[inline]
    fn segment(&self, segment: usize) -> *mut Slot<T> {
        let base = self.segments[segment].load(Ordering::Acquire);
        if base.is_null() {
            self.grow(segment)
        } else {
            base
        }
    }

    #[cold]
    fn grow(&self, segment: usize) -> *mut Slot<T> {
        let len = segment_len(segment);
        let slots: Box<[Slot<T>]> = (0..len).map(|_| Slot::new()).collect();
        let fresh = Box::into_raw(slots).cast::<Slot<T>>();

        match self.segments[segment].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::debug!(segment, slots = len, "stack arena grew");
                fresh
            }
            Err(existing) => {
                // Lost the race: free ours, use theirs.
                // SAFETY: `fresh` came from `Box::into_raw` above with `len`
                // elements and was never shared.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, len)) });
                existing
            }
        }
    }
}

impl<T> Drop for Arena<T> {
    fn drop(&mut self) {
        for (k, segment) in self.segments.iter().enumerate() {
            let base = segment.load(Ordering::Acquire);
            if !base.is_null() {
                // SAFETY: allocated by `grow` with `segment_len(k)` slots.
                // Slot values are `MaybeUninit`; live values were dropped by
                // the owner before the arena.
                drop(unsafe {
                    Box::from_raw(ptr::slice_from_raw_parts_mut(base, segment_len(k)))
                });
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn locate_segment_boundaries() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(31), (0, 31));
        assert_eq!(locate(32), (1, 0));
        assert_eq!(locate(95), (1, 63));
        assert_eq!(locate(96), (2, 0));
        assert_eq!(locate((MAX_SLOTS - 1) as u32), (SEGMENTS - 1, segment_len(SEGMENTS - 1) - 1));
    }

    #[test]
    fn max_slots_fits_index_space() {
        assert_eq!(MAX_SLOTS, 4_294_967_264);
    }

    #[test]
    fn lazy_by_default() {
        let arena = Arena::<u64>::new(0, BackoffPolicy::Spin);
        assert_eq!(arena.allocated(), 0);
        assert_eq!(arena.acquire(), 0);
        assert_eq!(arena.allocated(), 32);
    }

    #[test]
    fn capacity_preallocates_segments() {
        let arena = Arena::<u64>::new(33, BackoffPolicy::Spin);
        assert_eq!(arena.allocated(), 32 + 64);

        let arena = Arena::<u64>::new(32, BackoffPolicy::Spin);
        assert_eq!(arena.allocated(), 32);
    }

    #[test]
    fn grows_when_segment_fills() {
        let arena = Arena::<u64>::new(0, BackoffPolicy::Spin);
        for expected in 0..33 {
            assert_eq!(arena.acquire(), expected);
        }
        assert_eq!(arena.allocated(), 32 + 64);
    }

    #[test]
    fn released_slots_are_reused_lifo() {
        let arena = Arena::<u64>::new(0, BackoffPolicy::Spin);
        let a = arena.acquire();
        let b = arena.acquire();
        arena.release(a);
        arena.release(b);
        assert_eq!(arena.acquire(), b);
        assert_eq!(arena.acquire(), a);
        assert_eq!(arena.acquire(), 2);
    }

    #[test]
    fn link_unlink_round_trip() {
        let arena = Arena::<u64>::new(0, BackoffPolicy::Spin);
        let head = AtomicTagged::new(Tagged::EMPTY);
        let mut c = Contention::unbounded(BackoffPolicy::Spin);

        let i = arena.acquire();
        arena.link(&head, i, &mut c).unwrap();
        assert_eq!(head.load(Ordering::Relaxed), Tagged::new(i, 1));
        assert_eq!(arena.slot(i).next(), NIL);

        assert_eq!(arena.unlink(&head, &mut c), Ok(Some(i)));
        assert_eq!(head.load(Ordering::Relaxed), Tagged::new(NIL, 2));
        assert_eq!(arena.unlink(&head, &mut c), Ok(None));
    }

    #[test]
    fn slot_values() {
        let arena = Arena::<String>::new(1, BackoffPolicy::Spin);
        let i = arena.acquire();
        let slot = arena.slot(i);
        unsafe {
            slot.write(String::from("hello"));
            assert_eq!(slot.read(), "hello");
        }
    }
}
