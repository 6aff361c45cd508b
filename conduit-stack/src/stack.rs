//! Lock-free LIFO stack.
//!
//! A Treiber stack over the slot [`Arena`]. The head is a [`Tagged`] index:
//! every successful push or pop advances its generation, so a thread
//! holding a stale snapshot of the head fails its compare-and-swap even if
//! the same slot has since returned to the top.
//!
//! Memory ordering:
//!
//! - Push writes the payload and the slot's `next` link, then publishes the
//!   slot with a release compare-and-swap.
//! - Pop acquires the head, reads `next` (which may be stale; the
//!   generation catches that), and on success owns the slot exclusively.
//! - The slot goes back to the arena's free list with a release, so the
//!   next owner observes the payload as already moved out.

use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU32;

use crossbeam_utils::CachePadded;

use crate::arena::Arena;
use crate::backoff::{BackoffPolicy, Contention, StackConfig};
use crate::error::{BuildError, Contended};
use crate::sync::{AtomicIsize, Ordering};
use crate::tagged::{AtomicTagged, Tagged, NIL};

// =============================================================================
// Stack
// =============================================================================

/// A multi-producer multi-consumer LIFO stack.
///
/// All operations take `&self`; share the stack between threads with an
/// `Arc` or a scoped borrow.
///
/// # Example
///
/// ```
/// use conduit_stack::Stack;
///
/// let stack = Stack::new();
/// stack.push(1);
/// stack.push(2);
/// stack.push(3);
///
/// assert_eq!(stack.pop(), Some(3));
/// assert_eq!(stack.pop(), Some(2));
/// assert_eq!(stack.pop(), Some(1));
/// assert_eq!(stack.pop(), None);
/// ```
pub struct Stack<T> {
    head: CachePadded<AtomicTagged>,
    len: CachePadded<AtomicIsize>,
    arena: Arena<T>,
    config: StackConfig,
    _marker: PhantomData<T>,
}

// SAFETY: values move between threads through push and pop, but are only
// ever accessed by the one thread that owns their slot.
unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    /// Creates an empty stack with the default configuration.
    ///
    /// No memory is allocated until the first push.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StackConfig::default())
    }

    /// Returns a builder for a configured stack.
    #[must_use]
    pub fn builder() -> StackBuilder<T> {
        StackBuilder::new()
    }

    /// `config` must already be validated.
    fn with_config(config: StackConfig) -> Self {
        tracing::debug!(
            capacity = config.capacity,
            backoff = ?config.backoff,
            max_attempts = ?config.max_attempts,
            "stack created"
        );
        Self {
            head: CachePadded::new(AtomicTagged::new(Tagged::EMPTY)),
            len: CachePadded::new(AtomicIsize::new(0)),
            arena: Arena::new(config.capacity, config.backoff),
            config,
            _marker: PhantomData,
        }
    }

    /// Pushes a value on top of the stack.
    ///
    /// Retries until it wins, applying the configured [`BackoffPolicy`]
    /// after each lost race.
    ///
    /// # Panics
    ///
    /// Panics if [`MAX_CAPACITY`](crate::MAX_CAPACITY) values are already
    /// live in the stack.
    pub fn push(&self, value: T) {
        let mut contention = Contention::unbounded(self.config.backoff);
        let pushed = self.push_with(value, &mut contention);
        debug_assert!(pushed.is_ok(), "unbounded push gave up");
    }

    /// Pushes a value, giving up after `max_attempts` lost races.
    ///
    /// Behaves like [`push`](Self::push) when no attempt budget is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns [`Contended`] holding the value if the budget ran out.
    ///
    /// # Panics
    ///
    /// Same as [`push`](Self::push).
    pub fn try_push(&self, value: T) -> Result<(), Contended<T>> {
        let mut contention = Contention::new(self.config.backoff, self.config.max_attempts);
        self.push_with(value, &mut contention)
    }

    /// Removes the top value, or returns `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let mut contention = Contention::unbounded(self.config.backoff);
        self.pop_with(&mut contention).unwrap_or(None)
    }

    /// Removes the top value, giving up after `max_attempts` lost races.
    ///
    /// # Errors
    ///
    /// Returns [`Contended`] if the budget ran out. The stack is unchanged.
    pub fn try_pop(&self) -> Result<Option<T>, Contended> {
        let mut contention = Contention::new(self.config.backoff, self.config.max_attempts);
        self.pop_with(&mut contention)
    }

    fn push_with(&self, value: T, contention: &mut Contention) -> Result<(), Contended<T>> {
        let index = self.arena.acquire();
        let slot = self.arena.slot(index);
        // SAFETY: `acquire` hands out slots nobody else references.
        unsafe { slot.write(value) };

        match self.arena.link(&self.head, index, contention) {
            Ok(()) => {
                self.len.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(gave_up) => {
                // SAFETY: never published, still ours.
                let value = unsafe { slot.read() };
                self.arena.release(index);
                Err(gave_up.with_value(value))
            }
        }
    }

    fn pop_with(&self, contention: &mut Contention) -> Result<Option<T>, Contended> {
        let Some(index) = self.arena.unlink(&self.head, contention)? else {
            return Ok(None);
        };
        // SAFETY: the successful unlink made this thread the slot's only
        // owner, and it holds the value written by the push that linked it.
        let value = unsafe { self.arena.slot(index).read() };
        self.arena.release(index);
        self.len.fetch_sub(1, Ordering::Relaxed);
        Ok(Some(value))
    }

    /// Returns `true` if the stack holds no values.
    ///
    /// A snapshot: concurrent pushes and pops may change it immediately.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_nil()
    }

    /// Approximate number of values in the stack.
    ///
    /// Updated after each successful push or pop, so it can briefly lag
    /// the head under contention. Exact when the stack is quiescent.
    #[inline]
    pub fn len(&self) -> usize {
        usize::try_from(self.len.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Number of slots the stack has allocated, used or not.
    ///
    /// Slots are reused but never returned to the allocator until the stack
    /// is dropped.
    pub fn allocated(&self) -> usize {
        self.arena.allocated()
    }

    /// The configuration the stack was built with.
    #[inline]
    pub const fn config(&self) -> &StackConfig {
        &self.config
    }

    #[cfg(test)]
    fn generation(&self) -> u32 {
        self.head.load(Ordering::Relaxed).generation()
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("len", &self.len())
            .field("allocated", &self.allocated())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        let mut index = self.head.load(Ordering::Acquire).index();
        let mut remaining = 0usize;
        while index != NIL {
            let slot = self.arena.slot(index);
            // SAFETY: `&mut self` means no operation is in flight, and every
            // slot reachable from the head holds a value.
            unsafe { slot.drop_value() };
            index = slot.next();
            remaining += 1;
        }
        if remaining > 0 {
            tracing::trace!(remaining, "stack dropped with values");
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a configured [`Stack`].
///
/// ```
/// use std::num::NonZeroU32;
/// use conduit_stack::{BackoffPolicy, Stack};
///
/// let stack: Stack<u64> = Stack::builder()
///     .capacity(1024)
///     .backoff(BackoffPolicy::Yield)
///     .max_attempts(NonZeroU32::new(64).unwrap())
///     .build()?;
///
/// assert!(stack.allocated() >= 1024);
/// # Ok::<(), conduit_stack::BuildError>(())
/// ```
pub struct StackBuilder<T> {
    config: StackConfig,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StackBuilder<T> {
    /// Starts from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: StackConfig::default(),
            _marker: PhantomData,
        }
    }

    /// Pre-allocate slots for at least this many values.
    /// The stack still grows beyond it. Default: 0.
    #[must_use]
    pub fn capacity(mut self, slots: usize) -> Self {
        self.config.capacity = slots;
        self
    }

    /// Policy applied after a lost compare-and-swap. Default: `Spin`.
    #[must_use]
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.backoff = policy;
        self
    }

    /// Attempt budget for `try_push` and `try_pop`. Default: unbounded.
    #[must_use]
    pub fn max_attempts(mut self, attempts: NonZeroU32) -> Self {
        self.config.max_attempts = Some(attempts);
        self
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: StackConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the stack.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] if the configuration is invalid.
    pub fn build(self) -> Result<Stack<T>, BuildError> {
        self.config.validate()?;
        Ok(Stack::with_config(self.config))
    }
}

impl<T> Default for StackBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for StackBuilder<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StackBuilder<T> {}

impl<T> fmt::Debug for StackBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackBuilder")
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
