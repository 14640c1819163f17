//! Reporter Port (Driven Port)
//!
//! Latency telemetry sink. Reporting is best effort: a reporter that panics
//! is logged and otherwise ignored.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

/// Receives latency observations.
pub trait Reporter: Send + Sync {
    /// Record how long an operation took.
    ///
    /// `name` is one of `subscribe`, `unsubscribe`, `request` or `ping`;
    /// `message` is the payload that was sent, for correlation in logs.
    fn latency(&self, name: &str, message: &[u8], duration: Duration);
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn latency(&self, _name: &str, _message: &[u8], _duration: Duration) {}
}

/// Report latency without letting the reporter fail the caller.
pub fn report_latency(reporter: &dyn Reporter, name: &str, message: &[u8], duration: Duration) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        reporter.latency(name, message, duration);
    }));
    if result.is_err() {
        tracing::warn!(operation = name, "Latency reporter panicked");
    }
}
