//! Progress-callback trait for per-request pool events.
//!
//! Inject an [`Arc<dyn WorkProgressCallback>`] via
//! [`crate::config::PoolConfigBuilder::progress_callback`] to observe requests
//! as workers pick them up, retry them, and finish them.
//!
//! Callbacks fire from worker tasks, concurrently. Implementations must
//! protect shared mutable state themselves (`Mutex`, atomics).
//!
//! # Example
//!
//! ```rust
//! use pdf2md_pool::{PoolConfig, WorkProgressCallback, WorkResult};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Done(AtomicUsize);
//!
//! impl WorkProgressCallback for Done {
//!     fn on_work_complete(&self, _name: &str, _result: &WorkResult) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PoolConfig::builder()
//!     .progress_callback(Arc::new(Done(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::WorkResult;
use std::sync::Arc;

/// Called by workers as they process requests. All methods default to no-ops.
pub trait WorkProgressCallback: Send + Sync {
    /// A worker dequeued the request and is about to run it.
    fn on_work_start(&self, worker: usize, display_name: &str) {
        let _ = (worker, display_name);
    }

    /// An attempt failed; `attempt` is 1-based. More attempts may follow.
    fn on_attempt_failed(&self, display_name: &str, attempt: u32, error: &str) {
        let _ = (display_name, attempt, error);
    }

    /// The request reached a terminal state.
    fn on_work_complete(&self, display_name: &str, result: &WorkResult) {
        let _ = (display_name, result);
    }
}

/// A callback that ignores every event.
///
/// Leaving [`crate::config::PoolConfig::progress_callback`] unset already
/// skips all notifications; pass this explicitly where an API demands a
/// callback value.
pub struct NoopProgressCallback;

impl WorkProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PoolConfig`].
pub type ProgressCallback = Arc<dyn WorkProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::output::WorkOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct Tracking {
        starts: AtomicUsize,
        retries: AtomicUsize,
        completes: AtomicUsize,
    }

    impl WorkProgressCallback for Tracking {
        fn on_work_start(&self, _worker: usize, _name: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_attempt_failed(&self, _name: &str, _attempt: u32, _error: &str) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn on_work_complete(&self, _name: &str, _result: &WorkResult) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_work_start(0, "a.pdf");
        cb.on_attempt_failed("a.pdf", 1, "timeout");
    }

    #[test]
    fn tracking_callback_receives_events() {
        let t = Tracking::default();
        let result = WorkResult {
            request_id: Uuid::nil(),
            display_name: "a.pdf".into(),
            outcome: WorkOutcome::Failure {
                kind: FailureKind::BackendUnavailable,
                message: "down".into(),
            },
            attempts: 3,
            elapsed_ms: 0,
        };
        t.on_work_start(1, "a.pdf");
        t.on_attempt_failed("a.pdf", 1, "down");
        t.on_attempt_failed("a.pdf", 2, "down");
        t.on_work_complete("a.pdf", &result);
        assert_eq!(t.starts.load(Ordering::SeqCst), 1);
        assert_eq!(t.retries.load(Ordering::SeqCst), 2);
        assert_eq!(t.completes.load(Ordering::SeqCst), 1);
    }
}
