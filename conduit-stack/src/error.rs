//! Error types.

use std::fmt;

/// Error returned by [`StackBuilder::build`](crate::StackBuilder::build).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// `BackoffPolicy::Park` was given a zero interval.
    #[error("park interval must be non-zero")]
    ZeroParkInterval,
    /// The requested capacity exceeds what 32-bit slot indices can address.
    #[error("capacity {requested} exceeds the maximum of {max} slots")]
    CapacityTooLarge {
        /// Requested slot count.
        requested: usize,
        /// Largest supported slot count.
        max: usize,
    },
}

/// A bounded operation ran out of attempts.
///
/// For [`try_push`](crate::Stack::try_push) the rejected value rides along
/// and can be recovered with [`into_inner`](Self::into_inner).
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("gave up after {attempts} contended attempts")]
pub struct Contended<T = ()> {
    value: T,
    attempts: u32,
}

impl<T> Contended<T> {
    pub(crate) const fn new(value: T, attempts: u32) -> Self {
        Self { value, attempts }
    }

    /// Number of compare-and-swap attempts that failed.
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns the value that could not be pushed.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl Contended {
    pub(crate) const fn with_value<T>(self, value: T) -> Contended<T> {
        Contended::new(value, self.attempts)
    }
}

impl<T> fmt::Debug for Contended<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contended")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contended_hands_value_back() {
        let err = Contended::new((), 4).with_value(String::from("payload"));
        assert_eq!(err.attempts(), 4);
        assert_eq!(err.to_string(), "gave up after 4 contended attempts");
        assert_eq!(err.into_inner(), "payload");
    }

    #[test]
    fn debug_hides_value() {
        let err = Contended::new(vec![1, 2, 3], 2);
        assert_eq!(format!("{err:?}"), "Contended { attempts: 2, .. }");
    }

    #[test]
    fn build_error_messages() {
        assert_eq!(
            BuildError::ZeroParkInterval.to_string(),
            "park interval must be non-zero"
        );
        let err = BuildError::CapacityTooLarge {
            requested: 10,
            max: 5,
        };
        assert_eq!(err.to_string(), "capacity 10 exceeds the maximum of 5 slots");
    }
}
