//! Single-producer single-consumer (SPSC) bounded ring buffer.
//!
//! A fixed array of `N` slots (`N` a power of two) indexed by two cursors:
//! the producer owns the write cursor, the consumer owns the read cursor.
//! One slot always stays empty so that `write == read` means empty and
//! `write + 1 == read` means full, with no extra shared state. The usable
//! capacity is therefore `N - 1`.
//!
//! Both operations are wait-free: no allocation, no compare-and-swap, no
//! retry loop. Each side publishes its cursor with a release store and reads
//! the other side's cursor with an acquire load.
//!
//! # Example
//!
//! ```
//! use conduit_queue::spsc;
//!
//! let (mut producer, mut consumer) = spsc::ring_buffer::<u64>(8);
//! assert_eq!(producer.capacity(), 7);
//!
//! producer.push(1).unwrap();
//! producer.push(2).unwrap();
//!
//! assert_eq!(consumer.pop(), Some(1));
//! assert_eq!(consumer.pop(), Some(2));
//! assert_eq!(consumer.pop(), None);
//! ```
//!
//! # Performance Notes
//!
//! Each handle caches the other side's cursor. The hot path (neither full
//! nor empty) touches only local state plus one release store; the shared
//! cursor is re-read only when the cached value says full or empty.
//!
//! # Memory Layout
//!
//! The two cursors live on separate cache lines to prevent false sharing
//! between the producer and consumer threads.

use std::fmt;
use std::mem::MaybeUninit;
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::sync::{AtomicUsize, Ordering, UnsafeCell};

/// Creates a new SPSC ring buffer with `slots` storage slots.
///
/// `slots` is rounded up to the next power of two, with a minimum of 2.
/// One slot is reserved, so the buffer holds at most `slots - 1` elements.
///
/// Returns a `(Producer, Consumer)` pair.
///
/// # Panics
///
/// Panics if the rounded slot count does not fit in a `usize`.
///
/// # Example
///
/// ```
/// use conduit_queue::spsc;
///
/// let (tx, _rx) = spsc::ring_buffer::<u64>(100);
/// assert_eq!(tx.slots(), 128);
/// assert_eq!(tx.capacity(), 127);
/// ```
pub fn ring_buffer<T>(slots: usize) -> (Producer<T>, Consumer<T>) {
    let Some(slots) = slots.max(2).checked_next_power_of_two() else {
        panic!("ring buffer slot count overflows usize: {slots}");
    };
    build(slots)
}

/// Creates a new SPSC ring buffer, rejecting slot counts that would need
/// rounding.
///
/// # Errors
///
/// Returns [`CapacityError`] if `slots` is not a power of two or is smaller
/// than 2.
///
/// # Example
///
/// ```
/// use conduit_queue::spsc;
///
/// assert!(spsc::try_ring_buffer::<u64>(8).is_ok());
/// assert!(spsc::try_ring_buffer::<u64>(12).is_err());
/// assert!(spsc::try_ring_buffer::<u64>(1).is_err());
/// ```
pub fn try_ring_buffer<T>(slots: usize) -> Result<(Producer<T>, Consumer<T>), CapacityError> {
    if slots < 2 || !slots.is_power_of_two() {
        return Err(CapacityError { requested: slots });
    }
    Ok(build(slots))
}

fn build<T>(slots: usize) -> (Producer<T>, Consumer<T>) {
    assert!(
        slots >= 2 && slots.is_power_of_two(),
        "slots not a power of two: {slots}"
    );

    let mask = slots - 1;
    let buffer: Box<[Slot<T>]> = (0..slots)
        .map(|_| Slot(UnsafeCell::new(MaybeUninit::uninit())))
        .collect();
    let buffer_ptr = buffer.as_ptr();

    let inner = Arc::new(Inner {
        write: CachePadded::new(AtomicUsize::new(0)),
        read: CachePadded::new(AtomicUsize::new(0)),
        buffer,
        mask,
    });

    tracing::debug!(slots, capacity = mask, "spsc ring buffer created");

    (
        Producer {
            local_write: 0,
            cached_read: 0,
            buffer: buffer_ptr,
            mask,
            inner: Arc::clone(&inner),
        },
        Consumer {
            local_read: 0,
            cached_write: 0,
            buffer: buffer_ptr,
            mask,
            inner,
        },
    )
}

/// Storage for one element. Initialized iff its index lies in
/// `[read, write)` (modulo the slot count).
#[repr(transparent)]
struct Slot<T>(UnsafeCell<MaybeUninit<T>>);

/// Shared state between producer and consumer.
struct Inner<T> {
    // === Separate cache lines (CachePadded handles this) ===
    /// Producer's write cursor, always in `0..slots`.
    write: CachePadded<AtomicUsize>,
    /// Consumer's read cursor, always in `0..slots`.
    read: CachePadded<AtomicUsize>,

    // === Immutable after construction ===
    buffer: Box<[Slot<T>]>,
    /// Slot count - 1, for wrapping via bitwise AND.
    mask: usize,
}

// Safety: Producer and Consumer have exclusive access to disjoint slot
// ranges, handed over through the cursor publication.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    #[inline]
    fn len(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.wrapping_sub(read) & self.mask
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let write = self.write.load(Ordering::Relaxed);
        let mut read = self.read.load(Ordering::Relaxed);
        let mut remaining = 0usize;

        while read != write {
            // Safety: slots in [read, write) hold initialized values and
            // nobody else can observe them any more.
            self.buffer[read]
                .0
                .with_mut(|p| unsafe { (*p).assume_init_drop() });
            read = (read + 1) & self.mask;
            remaining += 1;
        }

        if remaining > 0 {
            tracing::trace!(remaining, "spsc ring buffer dropped with unconsumed elements");
        }
    }
}

/// The producer half of an SPSC ring buffer.
///
/// Use [`push`](Producer::push) to add elements. Takes `&mut self` to
/// statically ensure single-producer access.
///
/// This struct can be sent to another thread but cannot be shared
/// (implements `Send` but not `Sync`).
pub struct Producer<T> {
    // === Hot path fields ===
    /// Our write cursor (authoritative).
    local_write: usize,
    /// Last observed consumer read cursor.
    cached_read: usize,
    /// Cached buffer pointer - avoids Arc deref on hot path.
    buffer: *const Slot<T>,
    mask: usize,

    // === Cold path fields ===
    inner: Arc<Inner<T>>,
}

// Safety: Producer is Send but not Sync - only one thread can use it.
unsafe impl<T: Send> Send for Producer<T> {}

impl<T> Producer<T> {
    /// Attempts to push a value into the ring buffer.
    ///
    /// Returns `Err(Full(value))` if the buffer is full, giving the value back
    /// to the caller. Never blocks.
    ///
    /// # Example
    ///
    /// ```
    /// use conduit_queue::spsc::{self, Full};
    ///
    /// let (mut producer, _consumer) = spsc::ring_buffer::<u32>(2);
    ///
    /// assert!(producer.push(1).is_ok());
    ///
    /// // One usable slot: the buffer is now full
    /// assert_eq!(producer.push(2), Err(Full(2)));
    /// ```
    #[inline]
    pub fn push(&mut self, value: T) -> Result<(), Full<T>> {
        let write = self.local_write;
        let next = (write + 1) & self.mask;

        if next == self.cached_read {
            // Refresh cache
            self.cached_read = self.inner.read.load(Ordering::Acquire);
            if next == self.cached_read {
                return Err(Full(value));
            }
        }

        // Safety: `write` is outside [read, write) so the consumer cannot be
        // touching this slot, and it holds no live value.
        let slot = unsafe { &*self.buffer.add(write) };
        slot.0.with_mut(|p| unsafe {
            (*p).write(value);
        });

        self.inner.write.store(next, Ordering::Release);
        self.local_write = next;
        Ok(())
    }

    /// Returns the number of elements the buffer can hold (`slots - 1`).
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.mask
    }

    /// Returns the number of storage slots, including the reserved one.
    #[inline]
    pub const fn slots(&self) -> usize {
        self.mask + 1
    }

    /// Returns the number of elements currently in the buffer.
    ///
    /// Note: This is a snapshot and may be immediately stale in concurrent contexts.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the buffer is empty. Snapshot, see [`len`](Self::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the buffer is full. Snapshot, see [`len`](Self::len).
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.mask
    }

    /// Returns `true` if the consumer has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// The consumer half of an SPSC ring buffer.
///
/// Use [`pop`](Consumer::pop) to remove elements. Takes `&mut self` to
/// statically ensure single-consumer access.
///
/// This struct can be sent to another thread but cannot be shared
/// (implements `Send` but not `Sync`).
pub struct Consumer<T> {
    // === Hot path fields ===
    /// Our read cursor (authoritative).
    local_read: usize,
    /// Last observed producer write cursor.
    cached_write: usize,
    /// Cached buffer pointer - avoids Arc deref on hot path.
    buffer: *const Slot<T>,
    mask: usize,

    // === Cold path fields ===
    inner: Arc<Inner<T>>,
}

// Safety: Consumer is Send but not Sync - only one thread can use it.
unsafe impl<T: Send> Send for Consumer<T> {}

impl<T> Consumer<T> {
    /// Attempts to pop a value from the ring buffer.
    ///
    /// Returns `None` if the buffer is empty. Values come out in the order
    /// they were pushed.
    ///
    /// # Example
    ///
    /// ```
    /// use conduit_queue::spsc;
    ///
    /// let (mut producer, mut consumer) = spsc::ring_buffer::<u32>(8);
    ///
    /// // Queue is empty
    /// assert_eq!(consumer.pop(), None);
    ///
    /// producer.push(42).unwrap();
    /// assert_eq!(consumer.pop(), Some(42));
    /// ```
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        let read = self.local_read;
        if !self.has_element(read) {
            return None;
        }

        // Safety: `read` is in [read, write), so the producer published a
        // value here and will not touch the slot until we advance.
        let slot = unsafe { &*self.buffer.add(read) };
        let value = slot.0.with(|p| unsafe { (*p).assume_init_read() });

        let next = (read + 1) & self.mask;
        self.inner.read.store(next, Ordering::Release);
        self.local_read = next;
        Some(value)
    }

    /// Returns a reference to the oldest element without removing it.
    ///
    /// # Example
    ///
    /// ```
    /// use conduit_queue::spsc;
    ///
    /// let (mut producer, mut consumer) = spsc::ring_buffer::<String>(4);
    /// assert!(consumer.peek().is_none());
    ///
    /// producer.push("first".to_string()).unwrap();
    /// assert_eq!(consumer.peek().map(String::as_str), Some("first"));
    /// assert_eq!(consumer.pop().as_deref(), Some("first"));
    /// ```
    #[inline]
    pub fn peek(&mut self) -> Option<&T> {
        let read = self.local_read;
        if !self.has_element(read) {
            return None;
        }

        // Safety: see `pop`. The borrow is tied to `&mut self`, so the slot
        // cannot be released while the reference is alive.
        let slot = unsafe { &*self.buffer.add(read) };
        Some(slot.0.with(|p| unsafe { (*p).assume_init_ref() }))
    }

    #[inline]
    fn has_element(&mut self, read: usize) -> bool {
        if read != self.cached_write {
            return true;
        }
        // Refresh cache
        self.cached_write = self.inner.write.load(Ordering::Acquire);
        read != self.cached_write
    }

    /// Returns the number of elements the buffer can hold (`slots - 1`).
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.mask
    }

    /// Returns the number of storage slots, including the reserved one.
    #[inline]
    pub const fn slots(&self) -> usize {
        self.mask + 1
    }

    /// Returns the number of elements currently in the buffer.
    ///
    /// Note: This is a snapshot and may be immediately stale in concurrent contexts.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the buffer is empty. Snapshot, see [`len`](Self::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the buffer is full. Snapshot, see [`len`](Self::len).
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.mask
    }

    /// Returns `true` if the producer has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Error returned by [`Producer::push`] when the ring buffer is full.
///
/// Contains the value that could not be pushed, allowing the caller to
/// retry, drop, or apply backpressure.
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ring buffer is full")]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Returns the value that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Full").finish_non_exhaustive()
    }
}

/// Error returned by [`try_ring_buffer`] for an unusable slot count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("slot count must be a power of two and at least 2, got {requested}")]
pub struct CapacityError {
    /// The rejected slot count.
    pub requested: usize,
}
