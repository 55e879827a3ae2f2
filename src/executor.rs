//! Bounded worker pool with a FIFO intake queue.
//!
//! [`Executor::start`] spawns `pool_size` worker tasks that pull jobs off a
//! shared queue in submission order. Each job runs to a terminal
//! [`WorkResult`] through the [`RetrySupervisor`]; the caller of
//! [`Executor::submit`] awaits that result on a oneshot channel.
//!
//! Workers are long-lived: a request that fails produces a failure result
//! and the worker moves on to the next job. Phase panics are retried by the
//! supervisor; anything that still unwinds out of it is caught here.

use crate::config::PoolConfig;
use crate::error::{panic_message, FailureKind, PoolError};
use crate::gate::{BackendGate, PreprocessGate};
use crate::health::{HealthCheck, HealthProbe, HealthReport};
use crate::output::{WorkOutcome, WorkResult};
use crate::pipeline::{InferenceBackend, Preprocessor};
use crate::progress::ProgressCallback;
use crate::request::WorkRequest;
use crate::scratch::{ScratchManager, ScratchStats};
use crate::supervisor::RetrySupervisor;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

struct Job {
    request: WorkRequest,
    reply: oneshot::Sender<WorkResult>,
}

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<Job>>>;

/// A running pool. Dropping it without [`Executor::shutdown`] lets queued
/// jobs finish in the background.
pub struct Executor<P, B> {
    /// `None` once shut down.
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Arc<RetrySupervisor<P, B>>,
    preprocess_gate: PreprocessGate,
    backend_gate: BackendGate,
    health: HealthProbe,
}

impl<P, B> Executor<P, B>
where
    P: Preprocessor,
    B: InferenceBackend<P::Output>,
{
    /// Build the shared gates and spawn the workers.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(
        config: PoolConfig,
        preprocessor: P,
        backend: B,
        health: Arc<dyn HealthCheck>,
    ) -> Result<Self, PoolError> {
        if config.pool_size == 0 {
            return Err(PoolError::InvalidConfig("Pool size must be ≥ 1".into()));
        }
        if config.backend_concurrency == 0 {
            return Err(PoolError::InvalidConfig(
                "Backend concurrency must be ≥ 1".into(),
            ));
        }

        let preprocess_gate = PreprocessGate::new();
        let backend_gate = BackendGate::new(config.backend_concurrency);
        let health = HealthProbe::new(
            health,
            config.health_timeout(),
            config.health_poll_interval(),
        );
        let scratch = ScratchManager::new(config.scratch_root.clone());

        let supervisor = Arc::new(RetrySupervisor::new(
            config.clone(),
            Arc::new(preprocessor),
            Arc::new(backend),
            preprocess_gate.clone(),
            backend_gate.clone(),
            health.clone(),
            scratch,
        ));

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: JobQueue = Arc::new(Mutex::new(receiver));

        let workers = (0..config.pool_size)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&queue),
                    Arc::clone(&supervisor),
                    config.progress_callback.clone(),
                ))
            })
            .collect();

        info!(
            "Executor started: {} workers, {} backend permits, {} retries",
            config.pool_size, config.backend_concurrency, config.max_retries
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            supervisor,
            preprocess_gate,
            backend_gate,
            health,
        })
    }

    /// Queue `request` and wait for its terminal result.
    ///
    /// Never returns an error: every outcome, including a closed pool, is a
    /// [`WorkResult`].
    pub async fn submit(&self, request: WorkRequest) -> WorkResult {
        let (reply, rx) = oneshot::channel();
        let id = request.id();
        let name = request.display_name().to_string();

        let Some(sender) = self.sender.lock().await.clone() else {
            return closed(&request);
        };
        if let Err(mpsc::error::SendError(job)) = sender.send(Job { request, reply }) {
            return closed(&job.request);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                error!("Worker dropped request {} without replying", id);
                WorkResult {
                    request_id: id,
                    display_name: name,
                    outcome: WorkOutcome::Failure {
                        kind: FailureKind::ExecutorClosed,
                        message: "worker stopped before replying".into(),
                    },
                    attempts: 0,
                    elapsed_ms: 0,
                }
            }
        }
    }

    /// Convenience wrapper around [`Executor::submit`].
    pub async fn submit_bytes(&self, payload: impl Into<Vec<u8>>, display_name: &str) -> WorkResult {
        self.submit(WorkRequest::new(payload, display_name)).await
    }

    /// One health probe against the backend.
    pub async fn health_report(&self) -> HealthReport {
        self.health.report().await
    }

    pub fn scratch_stats(&self) -> ScratchStats {
        self.supervisor.scratch().stats()
    }

    pub fn preprocess_gate(&self) -> &PreprocessGate {
        &self.preprocess_gate
    }

    pub fn backend_gate(&self) -> &BackendGate {
        &self.backend_gate
    }

    /// Stop accepting work, let queued jobs finish, and join the workers.
    ///
    /// Later submissions fail with [`FailureKind::ExecutorClosed`]. Calling it
    /// twice is harmless.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().await.take());
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Executor stopped");
    }
}

async fn worker_loop<P, B>(
    id: usize,
    queue: JobQueue,
    supervisor: Arc<RetrySupervisor<P, B>>,
    progress: Option<ProgressCallback>,
) where
    P: Preprocessor,
    B: InferenceBackend<P::Output>,
{
    loop {
        // The lock is held only while waiting; the next worker in line takes
        // the following job.
        let job = queue.lock().await.recv().await;
        let Some(Job { request, reply }) = job else {
            break;
        };

        let span = info_span!(
            "work",
            worker = id,
            request = %request.id(),
            name = %request.display_name()
        );

        if let Some(ref cb) = progress {
            cb.on_work_start(id, request.display_name());
        }

        let start = Instant::now();
        let started = AtomicU32::new(0);
        let result = async {
            info!("Started ({} bytes)", request.payload().len());
            let result = AssertUnwindSafe(supervisor.run_counted(&request, &started))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    error!("Supervisor panicked: {}", message);
                    WorkResult {
                        request_id: request.id(),
                        display_name: request.display_name().to_string(),
                        outcome: WorkOutcome::Failure {
                            kind: FailureKind::PhaseFailure,
                            message: format!("panicked: {message}"),
                        },
                        attempts: started.load(Ordering::Relaxed),
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    }
                });
            match result.failure_kind() {
                None => info!(
                    "Succeeded after {} attempt(s) in {}ms",
                    result.attempts, result.elapsed_ms
                ),
                Some(kind) => warn!(
                    "Failed ({}) after {} attempt(s) in {}ms",
                    kind, result.attempts, result.elapsed_ms
                ),
            }
            result
        }
        .instrument(span)
        .await;

        if let Some(ref cb) = progress {
            cb.on_work_complete(request.display_name(), &result);
        }

        // The submitter may have gone away; the work is done either way.
        let _ = reply.send(result);
    }
}

fn closed(request: &WorkRequest) -> WorkResult {
    WorkResult {
        request_id: request.id(),
        display_name: request.display_name().to_string(),
        outcome: WorkOutcome::Failure {
            kind: FailureKind::ExecutorClosed,
            message: "executor is not accepting work".into(),
        },
        attempts: 0,
        elapsed_ms: 0,
    }
}
