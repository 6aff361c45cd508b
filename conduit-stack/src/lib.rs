//! # conduit-stack
//!
//! Lock-free multi-producer multi-consumer LIFO stack.
//!
//! A Treiber stack whose head pairs a 32-bit slot index with a 32-bit
//! generation counter in a single `AtomicU64`. Nodes live in a segmented,
//! grow-only slot arena owned by the stack, which gives:
//!
//! - **ABA safety**: every successful push or pop advances the generation,
//!   so a recycled slot never passes for the head another thread saw.
//! - **Safe stale reads**: slot memory stays allocated until the stack
//!   drops, so a thread that lost a race reads a live atomic, never freed
//!   memory.
//! - **No per-operation allocation** once the arena is warm: popped slots
//!   go to a free list and are reused by later pushes.
//!
//! Contention handling is configurable per stack through
//! [`BackoffPolicy`], and [`try_push`](Stack::try_push) /
//! [`try_pop`](Stack::try_pop) bound the number of attempts.
//!
//! ## Example
//!
//! ```
//! use std::thread;
//! use conduit_stack::Stack;
//!
//! let stack = Stack::new();
//! thread::scope(|s| {
//!     for t in 0..4 {
//!         let stack = &stack;
//!         s.spawn(move || {
//!             for i in 0..100 {
//!                 stack.push(t * 100 + i);
//!             }
//!         });
//!     }
//! });
//!
//! assert_eq!(stack.len(), 400);
//! let mut sum = 0;
//! while let Some(v) = stack.pop() {
//!     sum += v;
//! }
//! assert_eq!(sum, (0..400).sum());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod arena;
mod backoff;
mod error;
mod stack;
mod sync;
mod tagged;

pub use arena::MAX_SLOTS as MAX_CAPACITY;
pub use backoff::{BackoffPolicy, StackConfig};
pub use error::{BuildError, Contended};
pub use stack::{Stack, StackBuilder};
