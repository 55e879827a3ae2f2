//! Retry supervisor: drives one request through its attempts.
//!
//! ## State machine
//!
//! ```text
//!                 unhealthy, budget left
//!   ┌──────────┐ ───────────────────────▶ ┌──────────────────┐
//!   │Attempting│                          │ WaitingForHealth │
//!   └──────────┘ ◀─── backoff, attempt+1 ─┴──────────────────┘
//!     │   │  ▲            (not recovered)       │ recovered
//!     │   │  └──── backoff, attempt+1 ──┐       ▼
//!     │   └── healthy ──▶ run phases ───┴─ fail ─ budget left
//!     │                       │ ok
//!     │                       ▼
//!     │                  Succeeded
//!     └─ unhealthy, no budget / fail, no budget ─▶ FailedTerminal
//! ```
//!
//! A health wait that never sees recovery still burns the attempt and falls
//! through to the next cycle rather than aborting the request. Only when the
//! budget is spent does an unhealthy probe become a terminal
//! `BackendUnavailable`.
//!
//! The scratch area is acquired once before the first attempt, shared by all
//! attempts, and released exactly once on entering a terminal state.

use crate::config::PoolConfig;
use crate::error::{panic_message, FailureKind, PhaseError};
use crate::gate::{BackendGate, PreprocessGate};
use crate::health::HealthProbe;
use crate::output::{WorkOutcome, WorkOutput, WorkResult};
use crate::pipeline::{InferenceBackend, Preprocessor};
use crate::request::WorkRequest;
use crate::scratch::ScratchManager;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
enum State {
    Attempting,
    WaitingForHealth,
    Succeeded(WorkOutput),
    FailedTerminal { kind: FailureKind, message: String },
}

/// Diagnostic record of one pass through the loop.
#[derive(Debug)]
struct Attempt {
    index: u32,
    healthy: bool,
    /// Outcome of the health wait, when one happened.
    recovered: Option<bool>,
    error: Option<String>,
}

impl Attempt {
    fn new(index: u32, healthy: bool) -> Self {
        Self {
            index,
            healthy,
            recovered: None,
            error: None,
        }
    }
}

/// Runs requests through local and remote phases with health-aware retries.
pub struct RetrySupervisor<P, B> {
    preprocessor: Arc<P>,
    backend: Arc<B>,
    preprocess_gate: PreprocessGate,
    backend_gate: BackendGate,
    health: HealthProbe,
    scratch: ScratchManager,
    config: PoolConfig,
}

impl<P, B> RetrySupervisor<P, B>
where
    P: Preprocessor,
    B: InferenceBackend<P::Output>,
{
    pub fn new(
        config: PoolConfig,
        preprocessor: Arc<P>,
        backend: Arc<B>,
        preprocess_gate: PreprocessGate,
        backend_gate: BackendGate,
        health: HealthProbe,
        scratch: ScratchManager,
    ) -> Self {
        Self {
            preprocessor,
            backend,
            preprocess_gate,
            backend_gate,
            health,
            scratch,
            config,
        }
    }

    pub fn scratch(&self) -> &ScratchManager {
        &self.scratch
    }

    /// Run `request` to a terminal state. Always returns a result.
    pub async fn run(&self, request: &WorkRequest) -> WorkResult {
        self.run_counted(request, &AtomicU32::new(0)).await
    }

    /// [`RetrySupervisor::run`], publishing the number of attempts started so
    /// far into `started`. Lets a caller that catches an unexpected unwind
    /// still report how far the request got.
    pub async fn run_counted(&self, request: &WorkRequest, started: &AtomicU32) -> WorkResult {
        let start = Instant::now();

        let mut scratch = match self.scratch.acquire(request.display_name()) {
            Ok(area) => area,
            Err(e) => {
                error!("Scratch allocation failed, not retrying: {}", e);
                return self.finish(
                    request,
                    WorkOutcome::Failure {
                        kind: FailureKind::ResourceError,
                        message: e.to_string(),
                    },
                    0,
                    start,
                );
            }
        };

        let mut history: Vec<Attempt> = Vec::new();
        let mut attempt: u32 = 0;
        let mut state = State::Attempting;

        let outcome = loop {
            state = match state {
                State::Attempting => {
                    started.store(attempt + 1, Ordering::Relaxed);
                    let healthy = self.health.is_healthy().await;
                    history.push(Attempt::new(attempt, healthy));

                    if healthy {
                        self.attempt_phases(request, scratch.path(), &mut attempt, &mut history)
                            .await
                    } else if attempt < self.config.max_retries {
                        warn!(
                            "Backend unhealthy before attempt {}/{}, waiting up to {}s",
                            attempt + 1,
                            self.config.max_retries + 1,
                            self.config.health_wait_secs
                        );
                        State::WaitingForHealth
                    } else {
                        let message = format!(
                            "backend unavailable: health check failed on final attempt {}",
                            attempt + 1
                        );
                        record_error(&mut history, &message);
                        self.notify_failed(request, attempt, &message);
                        State::FailedTerminal {
                            kind: FailureKind::BackendUnavailable,
                            message,
                        }
                    }
                }

                State::WaitingForHealth => {
                    let recovered = self
                        .health
                        .wait_until_healthy(self.config.health_wait())
                        .await;
                    if let Some(current) = history.last_mut() {
                        current.recovered = Some(recovered);
                    }

                    if recovered {
                        self.attempt_phases(request, scratch.path(), &mut attempt, &mut history)
                            .await
                    } else {
                        let message = format!(
                            "backend did not recover within {}s",
                            self.config.health_wait_secs
                        );
                        record_error(&mut history, &message);
                        self.after_failure(
                            request,
                            &mut attempt,
                            FailureKind::BackendUnavailable,
                            message,
                        )
                        .await
                    }
                }

                State::Succeeded(output) => break WorkOutcome::Success { output },
                State::FailedTerminal { kind, message } => {
                    break WorkOutcome::Failure { kind, message }
                }
            };
        };

        if let WorkOutcome::Failure { .. } = outcome {
            for a in &history {
                debug!(
                    "attempt {}: healthy={} recovered={:?} error={:?}",
                    a.index + 1,
                    a.healthy,
                    a.recovered,
                    a.error
                );
            }
        }
        if let Err(e) = scratch.release() {
            warn!("{}", e);
        }

        self.finish(request, outcome, attempt + 1, start)
    }

    /// Run both phases once and decide the next state.
    async fn attempt_phases(
        &self,
        request: &WorkRequest,
        scratch: &Path,
        attempt: &mut u32,
        history: &mut [Attempt],
    ) -> State {
        match self.execute(request, scratch).await {
            Ok(output) => {
                info!(
                    "Attempt {} succeeded ({} units)",
                    *attempt + 1,
                    output.units
                );
                State::Succeeded(output)
            }
            Err(e) => {
                let message = e.to_string();
                record_error(history, &message);
                self.after_failure(request, attempt, FailureKind::PhaseFailure, message)
                    .await
            }
        }
    }

    /// Local phase behind the preprocess gate, then remote phase behind a
    /// backend permit. The timeout covers the permit wait and the call. A
    /// panic in either phase fails the attempt like any other phase error.
    async fn execute(&self, request: &WorkRequest, scratch: &Path) -> Result<WorkOutput, PhaseError> {
        let preprocessor = Arc::clone(&self.preprocessor);
        let payload = request.shared_payload();
        let normalized = self
            .preprocess_gate
            .with_exclusive(move || preprocessor.preprocess(&payload))
            .await??;

        let api_timeout = self.config.api_timeout();
        let remote = self.backend_gate.with_permit(|| {
            AssertUnwindSafe(self.backend.infer(&normalized, scratch)).catch_unwind()
        });

        match timeout(api_timeout, remote).await {
            Ok(gated) => gated?.unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!("Remote phase panicked: {}", message);
                Err(PhaseError::Panicked(message))
            }),
            Err(_) => Err(PhaseError::Timeout {
                secs: api_timeout.as_secs(),
            }),
        }
    }

    /// Back off and retry if budget remains, else go terminal with `kind`.
    async fn after_failure(
        &self,
        request: &WorkRequest,
        attempt: &mut u32,
        kind: FailureKind,
        message: String,
    ) -> State {
        self.notify_failed(request, *attempt, &message);

        if *attempt >= self.config.max_retries {
            error!(
                "Attempt {}/{} failed, giving up: {}",
                *attempt + 1,
                self.config.max_retries + 1,
                message
            );
            return State::FailedTerminal { kind, message };
        }

        let delay = self.config.backoff_for(*attempt);
        warn!(
            "Attempt {}/{} failed, retrying in {}ms: {}",
            *attempt + 1,
            self.config.max_retries + 1,
            delay.as_millis(),
            message
        );
        sleep(delay).await;
        *attempt += 1;
        State::Attempting
    }

    fn notify_failed(&self, request: &WorkRequest, attempt: u32, message: &str) {
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_attempt_failed(request.display_name(), attempt + 1, message);
        }
    }

    fn finish(
        &self,
        request: &WorkRequest,
        outcome: WorkOutcome,
        attempts: u32,
        start: Instant,
    ) -> WorkResult {
        WorkResult {
            request_id: request.id(),
            display_name: request.display_name().to_string(),
            outcome,
            attempts,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn record_error(history: &mut [Attempt], message: &str) {
    if let Some(current) = history.last_mut() {
        current.error = Some(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthCheck, StaticHealth};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    impl Preprocessor for Echo {
        type Output = String;

        fn preprocess(&self, raw: &[u8]) -> Result<String, PhaseError> {
            Ok(String::from_utf8_lossy(raw).into_owned())
        }
    }

    /// Fails the first `fail_for` calls, then echoes its input.
    struct FailThenEcho {
        calls: AtomicUsize,
        fail_for: usize,
    }

    #[async_trait]
    impl InferenceBackend<String> for FailThenEcho {
        async fn infer(&self, input: &String, scratch: &Path) -> Result<WorkOutput, PhaseError> {
            assert!(scratch.is_dir());
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_for {
                return Err(PhaseError::Inference("HTTP 503".into()));
            }
            Ok(WorkOutput {
                content: input.clone(),
                units: 1,
                ..Default::default()
            })
        }
    }

    /// Panics on its first call, then echoes.
    struct PanicsOnce(AtomicUsize);

    #[async_trait]
    impl InferenceBackend<String> for PanicsOnce {
        async fn infer(&self, input: &String, _scratch: &Path) -> Result<WorkOutput, PhaseError> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("malformed reply");
            }
            Ok(WorkOutput {
                content: input.clone(),
                units: 1,
                ..Default::default()
            })
        }
    }

    fn supervisor(
        config: PoolConfig,
        fail_for: usize,
        health: Arc<dyn HealthCheck>,
    ) -> RetrySupervisor<Echo, FailThenEcho> {
        let probe = HealthProbe::new(health, Duration::from_millis(50), Duration::from_millis(5));
        RetrySupervisor::new(
            config.clone(),
            Arc::new(Echo),
            Arc::new(FailThenEcho {
                calls: AtomicUsize::new(0),
                fail_for,
            }),
            PreprocessGate::new(),
            BackendGate::new(config.backend_concurrency),
            probe,
            ScratchManager::new(config.scratch_root.clone()),
        )
    }

    fn fast_config() -> PoolConfig {
        PoolConfig::builder()
            .retry_backoff_ms(1)
            .health_wait_secs(0)
            .health_poll_interval_ms(1)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let sup = supervisor(fast_config(), 0, Arc::new(StaticHealth(true)));
        let result = sup.run(&WorkRequest::new(b"hello".to_vec(), "a.pdf")).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert_eq!(result.output().unwrap().content, "hello");
        assert_eq!(sup.scratch().stats().released, 1);
    }

    #[tokio::test]
    async fn phase_failure_then_success_uses_two_attempts() {
        let sup = supervisor(fast_config(), 1, Arc::new(StaticHealth(true)));
        let result = sup.run(&WorkRequest::new(b"x".to_vec(), "b.pdf")).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 2);
        let stats = sup.scratch().stats();
        assert_eq!((stats.acquired, stats.released), (1, 1));
    }

    #[tokio::test]
    async fn persistent_phase_failure_is_terminal() {
        let sup = supervisor(fast_config(), usize::MAX, Arc::new(StaticHealth(true)));
        let result = sup.run(&WorkRequest::new(b"x".to_vec(), "c.pdf")).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::PhaseFailure));
        assert_eq!(result.attempts, 3);
        assert!(result.error().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn always_unhealthy_consumes_every_attempt() {
        let sup = supervisor(fast_config(), 0, Arc::new(StaticHealth(false)));
        let result = sup.run(&WorkRequest::new(b"x".to_vec(), "d.pdf")).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::BackendUnavailable));
        assert_eq!(result.attempts, 3);
        assert_eq!(sup.scratch().stats().released, 1);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let config = PoolConfig::builder()
            .max_retries(0)
            .retry_backoff_ms(1)
            .build()
            .unwrap();
        let sup = supervisor(config, 0, Arc::new(StaticHealth(false)));
        let result = sup.run(&WorkRequest::new(b"x".to_vec(), "e.pdf")).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::BackendUnavailable));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn scratch_failure_is_not_retried() {
        let config = PoolConfig::builder()
            .scratch_root("/nonexistent/pdf2md-pool/scratch")
            .build()
            .unwrap();
        let sup = supervisor(config, 0, Arc::new(StaticHealth(true)));
        let result = sup.run(&WorkRequest::new(b"x".to_vec(), "f.pdf")).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::ResourceError));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn remote_panic_is_retried_and_returns_the_permit() {
        let config = fast_config();
        let gate = BackendGate::new(config.backend_concurrency);
        let probe = HealthProbe::new(
            Arc::new(StaticHealth(true)),
            Duration::from_millis(50),
            Duration::from_millis(5),
        );
        let sup = RetrySupervisor::new(
            config.clone(),
            Arc::new(Echo),
            Arc::new(PanicsOnce(AtomicUsize::new(0))),
            PreprocessGate::new(),
            gate.clone(),
            probe,
            ScratchManager::new(config.scratch_root.clone()),
        );
        let result = sup.run(&WorkRequest::new(b"again".to_vec(), "g.pdf")).await;
        assert!(result.is_success(), "got: {:?}", result.error());
        assert_eq!(result.attempts, 2);
        assert_eq!(gate.available(), config.backend_concurrency);
        assert_eq!(sup.scratch().stats().released, 1);
    }

    #[tokio::test]
    async fn run_counted_publishes_attempts_started() {
        let sup = supervisor(fast_config(), usize::MAX, Arc::new(StaticHealth(true)));
        let started = AtomicU32::new(0);
        let result = sup
            .run_counted(&WorkRequest::new(b"x".to_vec(), "h.pdf"), &started)
            .await;
        assert_eq!(result.attempts, 3);
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }
}
