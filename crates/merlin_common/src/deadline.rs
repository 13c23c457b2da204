//! Deadlines for cooperative cancellation.
//!
//! Every potentially-suspending operation (buffer fill, permit wait, cache
//! lookup, cross-shard invoke) takes a `Deadline` and checks it before doing
//! work. Expiry surfaces as `QueryError::Timeout` naming the operation.

use std::time::{Duration, Instant};

use crate::error::QueryError;

/// A point in time after which an operation must give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn never() -> Deadline {
        Deadline { at: None }
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Deadline {
        Deadline {
            at: Some(Instant::now() + timeout),
        }
    }

    /// A deadline at an absolute instant.
    pub fn at(instant: Instant) -> Deadline {
        Deadline { at: Some(instant) }
    }

    pub fn expired(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Time left until expiry. `None` for a never-expiring deadline.
    /// Returns `Some(ZERO)` when already expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Check the deadline, naming the operation for the error message.
    pub fn check(&self, what: &str) -> Result<(), QueryError> {
        if self.expired() {
            return Err(QueryError::Timeout(what.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_does_not_expire() {
        let d = Deadline::never();
        assert!(!d.expired());
        assert!(d.remaining().is_none());
        assert!(d.check("noop").is_ok());
    }

    #[test]
    fn test_expired_deadline() {
        let d = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(d.expired());
        assert_eq!(d.remaining(), Some(Duration::ZERO));
        let err = d.check("fill_buffer").unwrap_err();
        assert!(err.to_string().contains("fill_buffer"));
    }

    #[test]
    fn test_future_deadline_has_remaining() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.expired());
        assert!(d.remaining().unwrap() > Duration::from_secs(30));
    }
}
