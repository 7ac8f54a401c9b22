//! Progress reporting and cancellation, consumed by long-running
//! operations (`create`, `validate`, `try_inflate`, `try_deflate`).
//!
//! Per spec §9, cancellation is modeled as a plain shared flag rather than
//! a cancellable task: no concurrency runtime is required, and the only
//! requirement on a [`ProgressSink`] is that it must not call back into
//! the component that invoked it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives `(current, target)` reports from a long-running operation.
/// `target` is `None` when the total amount of work is not known in
/// advance (e.g. `try_inflate` stopping early on a clean resize refusal).
pub trait ProgressSink {
    fn report(&self, current: u64, target: Option<u64>);
}

/// A `ProgressSink` that discards every report. The default for callers
/// that don't care about progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _current: u64, _target: Option<u64>) {}
}

impl<F: Fn(u64, Option<u64>)> ProgressSink for F {
    fn report(&self, current: u64, target: Option<u64>) {
        self(current, target)
    }
}

/// A shared, cloneable cancellation flag checked at safe points between
/// checkpoints (each completed page, each completed resize increment).
/// Cancelled operations return partial progress; they never raise an
/// error except `create`, which treats cancellation as leaving the
/// container's content undefined (still being initialised).
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A token that never reports cancellation; used where the caller has
    /// no cancellation source of their own.
    pub fn never() -> Self {
        Self::new()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_cancelled_by_default() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_observed_through_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn noop_progress_accepts_any_report() {
        NoopProgress.report(5, Some(10));
        NoopProgress.report(0, None);
    }
}
