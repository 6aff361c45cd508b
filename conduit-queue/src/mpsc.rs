//! Multi-producer single-consumer (MPSC) unbounded queue.
//!
//! An intrusive linked list with a permanent sentinel node. Producers
//! atomically exchange the shared tail pointer with their new node and then
//! link the previous tail to it. The consumer owns the head pointer outright:
//! the first unread element is always the sentinel's successor, and popping
//! it promotes that successor to be the new sentinel.
//!
//! # Example
//!
//! ```
//! use conduit_queue::mpsc;
//! use std::thread;
//!
//! let (tx, mut rx) = mpsc::unbounded::<u64>();
//!
//! // Clone sender for multiple producers
//! let tx2 = tx.clone();
//!
//! let h1 = thread::spawn(move || {
//!     for i in 0..100 {
//!         tx.push(i);
//!     }
//! });
//!
//! let h2 = thread::spawn(move || {
//!     for i in 100..200 {
//!         tx2.push(i);
//!     }
//! });
//!
//! let mut received = Vec::new();
//! while received.len() < 200 {
//!     if let Some(val) = rx.pop() {
//!         received.push(val);
//!     }
//! }
//!
//! h1.join().unwrap();
//! h2.join().unwrap();
//!
//! assert_eq!(received.len(), 200);
//! ```
//!
//! # Torn Links
//!
//! Between a producer's tail exchange and its link store the list is
//! momentarily split: the new node is reachable from `tail` but not from
//! `head`. The consumer never follows `tail`, so it simply sees "nothing
//! yet" at that point and finds the element on a later call. Elements
//! pushed by other producers after the split stay invisible until the
//! straggler finishes its store.

use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::sync::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Creates a new unbounded MPSC queue.
///
/// Returns a `(Sender, Receiver)` pair. The sender can be cloned for
/// additional producers.
///
/// # Example
///
/// ```
/// use conduit_queue::mpsc;
///
/// let (tx, mut rx) = mpsc::unbounded::<String>();
/// tx.push("hello".to_string());
/// assert_eq!(rx.pop().as_deref(), Some("hello"));
/// ```
pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    let sentinel = Node::<T>::sentinel();

    let inner = Arc::new(Inner {
        tail: CachePadded::new(AtomicPtr::new(sentinel.as_ptr())),
        head: AtomicPtr::new(sentinel.as_ptr()),
        sender_count: AtomicUsize::new(1),
        receiver_disconnected: AtomicBool::new(false),
    });

    tracing::debug!("mpsc queue created");

    (
        Sender {
            inner: Arc::clone(&inner),
        },
        Receiver {
            head: sentinel,
            inner,
        },
    )
}

/// A list node. `value` is initialized for every node reachable from the
/// sentinel's successor onwards, and uninitialized in the sentinel itself.
struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: MaybeUninit<T>,
}

impl<T> Node<T> {
    fn sentinel() -> NonNull<Self> {
        Self::alloc(MaybeUninit::uninit())
    }

    fn alloc(value: MaybeUninit<T>) -> NonNull<Self> {
        let node = Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        });
        // Safety: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }
}

/// Shared state between all senders and the receiver.
struct Inner<T> {
    /// Most recently enqueued node. Exchanged by every producer.
    tail: CachePadded<AtomicPtr<Node<T>>>,
    /// Consumer's sentinel, only written when the receiver is dropped so the
    /// last handle can free the remaining list.
    head: AtomicPtr<Node<T>>,

    // === Liveness tracking ===
    /// Number of senders alive. When 0, all producers disconnected.
    sender_count: AtomicUsize,
    /// Set when the receiver is dropped.
    receiver_disconnected: AtomicBool,
}

// Safety: nodes are handed between threads through the tail exchange and
// the release/acquire link, and payloads only move out on the consumer.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Relaxed);
        let mut remaining = 0usize;
        let mut is_sentinel = true;

        while !node.is_null() {
            // Safety: every handle is gone, so we own the whole list. Only
            // the sentinel has an uninitialized value.
            let mut boxed = unsafe { Box::from_raw(node) };
            if !is_sentinel {
                unsafe { boxed.value.assume_init_drop() };
                remaining += 1;
            }
            node = boxed.next.load(Ordering::Relaxed);
            is_sentinel = false;
        }

        if remaining > 0 {
            tracing::trace!(remaining, "mpsc queue dropped with unconsumed elements");
        }
    }
}

/// The sending half of an MPSC queue.
///
/// This struct can be cloned to create multiple producers.
/// All clones share the same underlying queue.
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Sender<T> {
    /// Pushes a value onto the back of the queue.
    ///
    /// Never fails and never blocks: the queue has no capacity bound. The
    /// node allocation is the only fallible step, and allocation failure
    /// aborts through the global allocation error handler.
    ///
    /// If the receiver has already been dropped the value is kept until the
    /// last sender goes away; check [`is_disconnected`](Self::is_disconnected)
    /// to stop producing early.
    #[inline]
    pub fn push(&self, value: T) {
        let node = Node::alloc(MaybeUninit::new(value));

        // The exchange totally orders producers; AcqRel so the previous tail
        // node (possibly another producer's allocation) is visible to us.
        let prev = self.inner.tail.swap(node.as_ptr(), Ordering::AcqRel);

        // Safety: `prev` cannot be freed before this store. The consumer only
        // frees a node after moving past it, which requires the link we are
        // about to write.
        unsafe { (*prev).next.store(node.as_ptr(), Ordering::Release) };
    }

    /// Returns `true` if the receiver has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        self.inner.receiver_disconnected.load(Ordering::Acquire)
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.sender_count.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // Release: every push this sender made happens-before the receiver
        // observing the count reach zero.
        self.inner.sender_count.fetch_sub(1, Ordering::Release);
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

/// The receiving half of an MPSC queue.
///
/// This struct cannot be cloned: there is only one consumer.
pub struct Receiver<T> {
    /// Current sentinel. We're the only reader, so no atomic needed.
    head: NonNull<Node<T>>,
    inner: Arc<Inner<T>>,
}

// Safety: Receiver can be sent to another thread, but not shared (not Sync).
unsafe impl<T: Send> Send for Receiver<T> {}

impl<T> Receiver<T> {
    /// Attempts to pop the oldest value from the queue.
    ///
    /// Returns `None` if no element is currently available. This includes a
    /// producer being midway through linking its node; the element shows up
    /// on a later call.
    ///
    /// # Example
    ///
    /// ```
    /// use conduit_queue::mpsc;
    ///
    /// let (tx, mut rx) = mpsc::unbounded::<u32>();
    /// assert_eq!(rx.pop(), None);
    ///
    /// tx.push(1);
    /// tx.push(2);
    /// assert_eq!(rx.pop(), Some(1));
    /// assert_eq!(rx.pop(), Some(2));
    /// assert_eq!(rx.pop(), None);
    /// ```
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        // Safety: the sentinel is owned by us and always valid.
        let next = unsafe { self.head.as_ref() }.next.load(Ordering::Acquire);
        let next = NonNull::new(next)?;

        // Safety: the acquire load above synchronizes with the producer's
        // release link, so the successor's value is fully written. Reading it
        // out turns the successor into the new (value-less) sentinel.
        let value = unsafe { ptr::addr_of!((*next.as_ptr()).value).read().assume_init() };

        // Safety: the old sentinel is unreachable for producers (its `next`
        // is already set) and its value was moved out earlier.
        drop(unsafe { Box::from_raw(self.head.as_ptr()) });
        self.head = next;

        Some(value)
    }

    /// Attempts to receive a value, distinguishing "empty for now" from
    /// "empty forever".
    ///
    /// # Errors
    ///
    /// Returns `Err(TryRecvError::Empty)` if no element is available but at
    /// least one sender is alive.
    ///
    /// Returns `Err(TryRecvError::Disconnected)` if all senders have been
    /// dropped AND every element they pushed has been consumed.
    ///
    /// # Example
    ///
    /// ```
    /// use conduit_queue::mpsc::{self, TryRecvError};
    ///
    /// let (tx, mut rx) = mpsc::unbounded::<u32>();
    /// assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    ///
    /// tx.push(42);
    /// drop(tx);
    /// assert_eq!(rx.try_recv(), Ok(42));
    /// assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    /// ```
    #[inline]
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        if let Some(value) = self.pop() {
            return Ok(value);
        }

        if self.inner.sender_count.load(Ordering::Acquire) != 0 {
            return Err(TryRecvError::Empty);
        }

        // Every sender is gone and their links happen-before the acquire
        // above, so one more look settles it.
        self.pop().ok_or(TryRecvError::Disconnected)
    }

    /// Returns an iterator that pops until the queue reports empty.
    ///
    /// # Example
    ///
    /// ```
    /// use conduit_queue::mpsc;
    ///
    /// let (tx, mut rx) = mpsc::unbounded::<u32>();
    /// for i in 0..4 {
    ///     tx.push(i);
    /// }
    /// assert_eq!(rx.drain().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    /// ```
    pub fn drain(&mut self) -> Drain<'_, T> {
        Drain { receiver: self }
    }

    /// Returns `true` if no element is currently available.
    ///
    /// Note: a producer may be mid-push, so this can flip to `false` at any moment.
    #[inline]
    pub fn is_empty(&self) -> bool {
        // Safety: the sentinel is owned by us and always valid.
        unsafe { self.head.as_ref() }
            .next
            .load(Ordering::Acquire)
            .is_null()
    }

    /// Returns `true` if all senders have been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        self.inner.sender_count.load(Ordering::Acquire) == 0
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        // Hand our sentinel back so whoever drops `Inner` frees the rest.
        self.inner.head.store(self.head.as_ptr(), Ordering::Relaxed);
        self.inner
            .receiver_disconnected
            .store(true, Ordering::Release);
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("empty", &self.is_empty())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

/// Iterator returned by [`Receiver::drain`].
#[derive(Debug)]
pub struct Drain<'a, T> {
    receiver: &'a mut Receiver<T>,
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    #[inline]
    fn next(&mut self) -> Option<T> {
        self.receiver.pop()
    }
}

/// Error returned by [`Receiver::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    /// The queue is empty.
    #[error("queue is empty")]
    Empty,
    /// All senders have been dropped and the queue is empty.
    #[error("all senders disconnected")]
    Disconnected,
}

impl TryRecvError {
    /// Returns `true` if this error is the `Empty` variant.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns `true` if this error is the `Disconnected` variant.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::thread;

    #[test]
    fn basic_push_pop() {
        let (tx, mut rx) = unbounded::<u64>();

        tx.push(1);
        tx.push(2);
        tx.push(3);

        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn fresh_queue_is_empty() {
        let (_tx, mut rx) = unbounded::<u64>();

        assert!(rx.is_empty());
        assert_eq!(rx.pop(), None);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn fifo_single_threaded() {
        let (tx, mut rx) = unbounded::<u64>();

        for i in 0..10_000 {
            tx.push(i);
        }
        assert!(!rx.is_empty());

        for i in 0..10_000 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn empty_then_refill() {
        let (tx, mut rx) = unbounded::<u64>();

        for round in 0..10 {
            tx.push(round);
            assert_eq!(rx.pop(), Some(round));
            assert_eq!(rx.pop(), None);
        }
    }

    #[test]
    fn sender_disconnect() {
        let (tx, mut rx) = unbounded::<u64>();

        tx.push(1);
        tx.push(2);

        drop(tx);

        assert!(rx.is_disconnected());
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn receiver_disconnect() {
        let (tx, rx) = unbounded::<u64>();
        assert!(!tx.is_disconnected());

        drop(rx);

        assert!(tx.is_disconnected());
        // Still accepted; freed with the queue.
        tx.push(1);
    }

    #[test]
    fn all_senders_drop() {
        let (tx1, mut rx) = unbounded::<u64>();
        let tx2 = tx1.clone();

        tx1.push(1);

        drop(tx1);
        // Still one sender alive
        assert!(!rx.is_disconnected());

        drop(tx2);
        // Now all senders dropped
        assert_eq!(rx.try_recv(), Ok(1));
        assert!(rx.try_recv().unwrap_err().is_disconnected());
    }

    #[test]
    fn drain_stops_at_empty() {
        let (tx, mut rx) = unbounded::<u64>();

        for i in 0..5 {
            tx.push(i);
        }
        let drained: Vec<_> = rx.drain().collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);

        tx.push(5);
        assert_eq!(rx.drain().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn move_only_payloads() {
        let (tx, mut rx) = unbounded::<Box<String>>();

        tx.push(Box::new("a".repeat(3)));
        tx.push(Box::new("b".repeat(5)));

        assert_eq!(rx.pop().as_deref().map(String::as_str), Some("aaa"));
        assert_eq!(rx.pop().as_deref().map(String::as_str), Some("bbbbb"));
    }

    #[test]
    fn zero_sized_type() {
        let (tx, mut rx) = unbounded::<()>();

        tx.push(());
        tx.push(());

        assert_eq!(rx.pop(), Some(()));
        assert_eq!(rx.pop(), Some(()));
        assert_eq!(rx.pop(), None);
    }

    #[derive(Debug)]
    struct DropCounter(Arc<StdAtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn with_drop_type() {
        let drop_count = Arc::new(StdAtomicUsize::new(0));

        let (tx, mut rx) = unbounded::<DropCounter>();

        tx.push(DropCounter(Arc::clone(&drop_count)));
        tx.push(DropCounter(Arc::clone(&drop_count)));
        tx.push(DropCounter(Arc::clone(&drop_count)));

        assert_eq!(drop_count.load(std::sync::atomic::Ordering::SeqCst), 0);

        let _ = rx.pop().unwrap();
        assert_eq!(drop_count.load(std::sync::atomic::Ordering::SeqCst), 1);

        drop(rx);
        assert_eq!(drop_count.load(std::sync::atomic::Ordering::SeqCst), 1);
        drop(tx);

        assert_eq!(drop_count.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn sender_outlives_receiver_drops_late_pushes() {
        let drop_count = Arc::new(StdAtomicUsize::new(0));

        let (tx, rx) = unbounded::<DropCounter>();
        tx.push(DropCounter(Arc::clone(&drop_count)));
        drop(rx);
        tx.push(DropCounter(Arc::clone(&drop_count)));
        drop(tx);

        assert_eq!(drop_count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn two_producers_preserve_per_producer_order() {
        const PER_PRODUCER: u64 = 1000;

        let (tx_a, mut rx) = unbounded::<(u8, u64)>();
        let tx_b = tx_a.clone();

        let a = thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                tx_a.push((0, i));
            }
        });
        let b = thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                tx_b.push((1, i));
            }
        });

        let mut next_expected = [0u64; 2];
        let mut total = 0u64;
        loop {
            match rx.try_recv() {
                Ok((producer, value)) => {
                    let slot = &mut next_expected[producer as usize];
                    assert_eq!(value, *slot, "producer {producer} reordered");
                    *slot += 1;
                    total += 1;
                }
                Err(TryRecvError::Empty) => std::thread::yield_now(),
                Err(TryRecvError::Disconnected) => break,
            }
        }

        a.join().unwrap();
        b.join().unwrap();

        assert!(rx.is_empty());
        assert_eq!(total, 2 * PER_PRODUCER);
        assert_eq!(next_expected, [PER_PRODUCER, PER_PRODUCER]);
    }

    #[test]
    fn no_message_loss_on_disconnect() {
        // Senders disconnecting while their last nodes are still in flight
        // must not make the receiver report Disconnected early.
        for _ in 0..50 {
            let (tx, mut rx) = unbounded::<u64>();
            const N: usize = 1000;
            const PRODUCERS: usize = 4;

            let handles: Vec<_> = (0..PRODUCERS)
                .map(|_| {
                    let tx = tx.clone();
                    thread::spawn(move || {
                        for i in 0..N {
                            tx.push(i as u64);
                        }
                    })
                })
                .collect();

            drop(tx);

            let mut count = 0;
            loop {
                match rx.try_recv() {
                    Ok(_) => count += 1,
                    Err(TryRecvError::Empty) => std::thread::yield_now(),
                    Err(TryRecvError::Disconnected) => break,
                }
            }

            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(count, N * PRODUCERS, "lost messages!");
        }
    }

    #[test]
    fn debug_impl() {
        let (tx, rx) = unbounded::<u64>();
        let _ = format!("{tx:?}");
        let _ = format!("{rx:?}");
        assert_eq!(TryRecvError::Empty.to_string(), "queue is empty");
    }
}
