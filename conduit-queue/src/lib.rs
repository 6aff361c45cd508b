//! # conduit-queue
//!
//! Lock-free queues for handing values between threads.
//!
//! ## Features
//!
//! - **SPSC**: Bounded single-producer single-consumer ring buffer. Wait-free,
//!   no allocation after construction.
//! - **MPSC**: Unbounded multi-producer single-consumer linked queue. One
//!   atomic exchange per push, no retry loops.
//!
//! ## Design Goals
//!
//! - Non-blocking everywhere: a full or empty queue is reported, never waited on
//! - Threading contracts enforced by the handle types, not by convention
//! - Cache-line isolation of producer and consumer state
//! - Every element left in a queue is dropped exactly once
//!
//! Callers that want to block layer their own spin, yield or park strategy
//! on top of `push`/`pop`.
//!
//! ## Example
//!
//! ```
//! use conduit_queue::{mpsc, spsc};
//!
//! // 8 slots, 7 usable
//! let (mut tx, mut rx) = spsc::ring_buffer::<u64>(8);
//! tx.push(42).unwrap();
//! assert_eq!(rx.pop(), Some(42));
//!
//! let (tx, mut rx) = mpsc::unbounded::<u64>();
//! tx.clone().push(1);
//! tx.push(2);
//! assert_eq!(rx.pop(), Some(1));
//! assert_eq!(rx.pop(), Some(2));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod mpsc;
pub mod spsc;

mod sync;
