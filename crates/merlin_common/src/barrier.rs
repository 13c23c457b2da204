//! Phased operation barrier.
//!
//! Tracks in-flight operations against a resource so a maintenance action
//! (schema change, table drop) can wait for the current phase to drain.
//! Starting an operation is wait-free; waiting out operations blocks with a
//! deadline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::deadline::Deadline;
use crate::error::QueryError;

#[derive(Default)]
struct BarrierState {
    in_flight: usize,
}

struct Shared {
    state: Mutex<BarrierState>,
    drained: Condvar,
}

/// Counts in-flight operations; `await_quiesce` blocks until the count
/// reaches zero.
pub struct OpBarrier {
    shared: Arc<Shared>,
}

impl OpBarrier {
    pub fn new() -> OpBarrier {
        OpBarrier {
            shared: Arc::new(Shared {
                state: Mutex::new(BarrierState::default()),
                drained: Condvar::new(),
            }),
        }
    }

    /// Start an operation. The returned guard marks it finished on drop.
    pub fn start_op(&self) -> Operation {
        self.shared.state.lock().in_flight += 1;
        Operation {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight
    }

    /// Block until all in-flight operations finish or the deadline expires.
    pub fn await_quiesce(&self, deadline: Deadline) -> Result<(), QueryError> {
        let mut state = self.shared.state.lock();
        while state.in_flight > 0 {
            let wait = match deadline.remaining() {
                Some(rem) if rem.is_zero() => {
                    return Err(QueryError::Timeout("barrier quiesce".into()))
                }
                Some(rem) => rem,
                None => Duration::from_secs(3600),
            };
            self.shared.drained.wait_for(&mut state, wait);
        }
        Ok(())
    }
}

impl Default for OpBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII ticket for one in-flight operation.
pub struct Operation {
    shared: Arc<Shared>,
}

impl Drop for Operation {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.shared.drained.notify_all();
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_counted_and_released() {
        let barrier = OpBarrier::new();
        assert_eq!(barrier.in_flight(), 0);
        {
            let _op = barrier.start_op();
            assert_eq!(barrier.in_flight(), 1);
        }
        assert_eq!(barrier.in_flight(), 0);
    }

    #[test]
    fn test_quiesce_immediate_when_idle() {
        let barrier = OpBarrier::new();
        assert!(barrier.await_quiesce(Deadline::never()).is_ok());
    }

    #[test]
    fn test_quiesce_times_out_while_busy() {
        let barrier = OpBarrier::new();
        let _op = barrier.start_op();
        let result = barrier.await_quiesce(Deadline::after(Duration::from_millis(10)));
        assert!(result.is_err());
    }
}
