//! Process-wide admission gates.
//!
//! Two shared primitives and nothing else carry cross-request state:
//!
//! * [`PreprocessGate`]: mutual exclusion around the local phase. pdfium
//!   keeps global state and is not reentrant, so at most one rasterisation
//!   runs at any instant even though workers run in parallel.
//! * [`BackendGate`]: a counting gate bounding in-flight backend calls.
//!
//! Both are cheap `Clone` handles over an `Arc` and are passed to workers
//! explicitly. Tokens are RAII guards, so every exit path (return, error,
//! panic, dropped future) gives them back.

use crate::error::PhaseError;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

/// Runs blocking closures one at a time, process-wide.
#[derive(Debug, Clone, Default)]
pub struct PreprocessGate {
    lock: Arc<Mutex<()>>,
}

impl PreprocessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the blocking pool while holding the gate.
    ///
    /// The owned guard moves into the blocking task, so if the calling
    /// future is dropped mid-call the gate stays held until `f` actually
    /// returns. A panic in `f` surfaces as [`PhaseError::Panicked`].
    pub async fn with_exclusive<F, T>(&self, f: F) -> Result<T, PhaseError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let wait_start = Instant::now();
        let guard = Arc::clone(&self.lock).lock_owned().await;
        debug!(
            "Preprocess gate acquired after {}ms",
            wait_start.elapsed().as_millis()
        );

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f()
        })
        .await
        .map_err(|e| PhaseError::Panicked(format!("preprocess task: {e}")))
    }

    /// True while some caller holds the gate.
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

/// Admits at most `capacity` concurrent backend calls.
#[derive(Debug, Clone)]
pub struct BackendGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BackendGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a permit, run `f`, release the permit.
    ///
    /// Admission is bounded, not ordered: any `capacity` holders may run in
    /// any relative order.
    pub async fn with_permit<F, Fut, T>(&self, f: F) -> Result<T, PhaseError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let wait_start = Instant::now();
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| PhaseError::Gate(e.to_string()))?;
        debug!(
            "Backend permit acquired after {}ms ({} of {} left)",
            wait_start.elapsed().as_millis(),
            self.permits.available_permits(),
            self.capacity
        );
        Ok(f().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn bump_max(current: &AtomicUsize, max: &AtomicUsize) {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn preprocess_gate_never_overlaps() {
        let gate = PreprocessGate::new();
        let current = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let gate = gate.clone();
                let (current, max) = (Arc::clone(&current), Arc::clone(&max));
                tokio::spawn(async move {
                    gate.with_exclusive(move || {
                        bump_max(&current, &max);
                        std::thread::sleep(Duration::from_millis(10));
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(max.load(Ordering::SeqCst), 1);
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn preprocess_panic_releases_gate() {
        let gate = PreprocessGate::new();
        let r: Result<(), _> = gate.with_exclusive(|| panic!("pdfium exploded")).await;
        assert!(matches!(r, Err(PhaseError::Panicked(_))));
        assert_eq!(gate.with_exclusive(|| 7).await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn backend_gate_bounds_in_flight_calls() {
        let gate = BackendGate::new(2);
        let current = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let (current, max) = (Arc::clone(&current), Arc::clone(&max));
                tokio::spawn(async move {
                    gate.with_permit(move || async move {
                        bump_max(&current, &max);
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();

        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert!(max.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.available(), 2);
    }

    #[tokio::test]
    async fn backend_permit_returned_on_error_value() {
        let gate = BackendGate::new(1);
        let r: Result<Result<(), &str>, _> = gate.with_permit(|| async { Err("503") }).await;
        assert_eq!(r.unwrap(), Err("503"));
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn backend_permit_returned_on_cancellation() {
        let gate = BackendGate::new(1);
        let slow = gate.with_permit(|| tokio::time::sleep(Duration::from_secs(60)));
        let _ = tokio::time::timeout(Duration::from_millis(10), slow).await;
        assert_eq!(gate.available(), 1);
    }
}
