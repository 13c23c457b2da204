//! Per-query trace points.
//!
//! A `TraceState` is carried through the whole read; when tracing is on it
//! records elapsed-time-stamped events (cache lookups, dismantle stats,
//! page stats) that tests and diagnostics can read back. Disabled tracing
//! is a no-op handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// One recorded trace point.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub elapsed: Duration,
    pub message: String,
}

/// Collects trace points for one query.
pub struct TraceLog {
    started: Instant,
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceLog {
    fn new() -> TraceLog {
        TraceLog {
            started: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.message.clone()).collect()
    }
}

/// Cheap cloneable tracing handle; `None` inside means tracing is off.
#[derive(Clone)]
pub struct TraceState {
    log: Option<Arc<TraceLog>>,
}

impl TraceState {
    pub fn disabled() -> TraceState {
        TraceState { log: None }
    }

    pub fn enabled() -> TraceState {
        TraceState {
            log: Some(Arc::new(TraceLog::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.log.is_some()
    }

    pub fn log(&self) -> Option<&Arc<TraceLog>> {
        self.log.as_ref()
    }

    pub fn trace(&self, message: impl FnOnce() -> String) {
        if let Some(log) = &self.log {
            let event = TraceEvent {
                elapsed: log.started.elapsed(),
                message: message(),
            };
            tracing::trace!("{}", event.message);
            log.events.lock().push(event);
        }
    }
}

impl std::fmt::Debug for TraceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceState")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_trace_records_nothing() {
        let trace = TraceState::disabled();
        trace.trace(|| "never materialized".to_string());
        assert!(trace.log().is_none());
    }

    #[test]
    fn test_enabled_trace_collects_events() {
        let trace = TraceState::enabled();
        trace.trace(|| "first".to_string());
        trace.clone().trace(|| "second".to_string());
        let messages = trace.log().unwrap().messages();
        assert_eq!(messages, vec!["first", "second"]);
    }
}
