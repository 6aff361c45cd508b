//! Contention handling and stack configuration.
//!
//! A [`BackoffPolicy`] decides what a thread does after losing a
//! compare-and-swap race on a list head. It is never consulted on the
//! uncontended path.

use std::num::NonZeroU32;

use crossbeam_utils::Backoff;

use crate::arena::MAX_SLOTS;
use crate::error::{BuildError, Contended};

/// What a thread does between failed compare-and-swap attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum BackoffPolicy {
    /// Retry immediately after a CPU spin hint.
    Immediate,
    /// Exponential spinning that escalates to yielding the time slice.
    #[default]
    Spin,
    /// Yield the time slice after every failed attempt.
    Yield,
    /// Park the thread for a fixed interval after every failed attempt.
    ///
    /// Suited to oversubscribed systems where spinning steals cycles from
    /// the thread that would make progress.
    Park {
        /// Park duration in microseconds. Must be non-zero.
        micros: u64,
    },
}

/// Runtime configuration of a [`Stack`](crate::Stack).
///
/// Usually assembled through [`StackBuilder`](crate::StackBuilder); with
/// the `serde` feature it can also be loaded from a config file, missing
/// fields taking their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct StackConfig {
    /// Policy applied after each failed compare-and-swap.
    pub backoff: BackoffPolicy,
    /// Attempt budget for [`try_push`](crate::Stack::try_push) and
    /// [`try_pop`](crate::Stack::try_pop). `None` means unbounded.
    pub max_attempts: Option<NonZeroU32>,
    /// Slots to allocate up front.
    pub capacity: usize,
}

impl StackConfig {
    /// Checks the configuration without building anything.
    ///
    /// # Errors
    ///
    /// [`BuildError::ZeroParkInterval`] for `Park { micros: 0 }`,
    /// [`BuildError::CapacityTooLarge`] when `capacity` exceeds the slot
    /// index space.
    pub const fn validate(&self) -> Result<(), BuildError> {
        if let BackoffPolicy::Park { micros: 0 } = self.backoff {
            return Err(BuildError::ZeroParkInterval);
        }
        if self.capacity > MAX_SLOTS {
            return Err(BuildError::CapacityTooLarge {
                requested: self.capacity,
                max: MAX_SLOTS,
            });
        }
        Ok(())
    }
}

/// Per-operation contention state: counts failed attempts and applies the
/// policy between them.
#[cfg_attr(loom, allow(dead_code))]
pub(crate) struct Contention {
    policy: BackoffPolicy,
    budget: Option<NonZeroU32>,
    spin: Backoff,
    failures: u32,
}

impl Contention {
    /// Retries forever.
    pub(crate) fn unbounded(policy: BackoffPolicy) -> Self {
        Self::new(policy, None)
    }

    /// Gives up once `budget` attempts have failed.
    pub(crate) fn new(policy: BackoffPolicy, budget: Option<NonZeroU32>) -> Self {
        Self {
            policy,
            budget,
            spin: Backoff::new(),
            failures: 0,
        }
    }

    /// Records a failed attempt. Waits per policy and returns `Ok` if
    /// another attempt is allowed.
    #[cold]
    pub(crate) fn failed(&mut self) -> Result<(), Contended> {
        self.failures = self.failures.saturating_add(1);
        if let Some(budget) = self.budget {
            if self.failures >= budget.get() {
                return Err(Contended::new((), self.failures));
            }
        }
        self.pause();
        Ok(())
    }

    #[cfg(not(loom))]
    fn pause(&self) {
        match self.policy {
            BackoffPolicy::Immediate => std::hint::spin_loop(),
            BackoffPolicy::Spin => self.spin.snooze(),
            BackoffPolicy::Yield => std::thread::yield_now(),
            BackoffPolicy::Park { micros } => {
                std::thread::park_timeout(std::time::Duration::from_micros(micros));
            }
        }
    }

    // Spinning never lets the model checker schedule the winner.
    #[cfg(loom)]
    #[allow(clippy::unused_self)]
    fn pause(&self) {
        loom::thread::yield_now();
    }
}
