//! Backend liveness probing.
//!
//! The probe answers one question before each attempt: is it worth calling
//! the backend right now? It never errors. Timeouts, connection failures and
//! non-2xx statuses all read as "unhealthy" (fail-closed), so a hung backend
//! costs at most one probe timeout instead of stalling the worker.

use crate::error::PoolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

/// A single liveness check against the backend.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// `true` only on a definitive healthy answer.
    async fn check(&self) -> bool;
}

/// `GET <base_url>/health`, healthy iff the status is 2xx.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthCheck {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, PoolError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PoolError::Internal(format!("health client: {e}")))?;
        Ok(Self {
            client,
            url: health_url(base_url),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                if !ok {
                    debug!("Health check {} returned HTTP {}", self.url, resp.status());
                }
                ok
            }
            Err(e) => {
                debug!("Health check {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// Reports a fixed answer. For backends without a health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct StaticHealth(pub bool);

#[async_trait]
impl HealthCheck for StaticHealth {
    async fn check(&self) -> bool {
        self.0
    }
}

/// Wraps a [`HealthCheck`] with a hard timeout and a recovery poll loop.
#[derive(Clone)]
pub struct HealthProbe {
    check: Arc<dyn HealthCheck>,
    timeout: Duration,
    poll_interval: Duration,
}

impl HealthProbe {
    pub fn new(check: Arc<dyn HealthCheck>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            check,
            timeout,
            poll_interval,
        }
    }

    /// One bounded probe. No answer within the timeout counts as unhealthy.
    pub async fn is_healthy(&self) -> bool {
        timeout(self.timeout, self.check.check())
            .await
            .unwrap_or(false)
    }

    /// Poll every `poll_interval` until healthy or `max_wait` has elapsed.
    ///
    /// Returns whether recovery was observed.
    pub async fn wait_until_healthy(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(self.poll_interval.min(remaining)).await;

            if self.is_healthy().await {
                info!("Backend recovered");
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Probe once and describe the result.
    pub async fn report(&self) -> HealthReport {
        HealthReport::from_probe(self.is_healthy().await)
    }
}

impl std::fmt::Debug for HealthProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProbe")
            .field("check", &"<dyn HealthCheck>")
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Serialisable health summary for the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// "healthy" or "degraded".
    pub status: String,
    /// "available" or "unavailable".
    pub backend: String,
}

impl HealthReport {
    pub fn from_probe(healthy: bool) -> Self {
        Self {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            backend: if healthy { "available" } else { "unavailable" }.to_string(),
        }
    }
}

fn health_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/health") {
        base.to_string()
    } else {
        format!("{base}/health")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Unhealthy for the first `fail_for` checks, healthy afterwards.
    struct Flaky {
        calls: AtomicUsize,
        fail_for: usize,
    }

    #[async_trait]
    impl HealthCheck for Flaky {
        async fn check(&self) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) >= self.fail_for
        }
    }

    struct Hangs;

    #[async_trait]
    impl HealthCheck for Hangs {
        async fn check(&self) -> bool {
            sleep(Duration::from_secs(3600)).await;
            true
        }
    }

    fn probe(check: Arc<dyn HealthCheck>) -> HealthProbe {
        HealthProbe::new(check, Duration::from_millis(50), Duration::from_millis(5))
    }

    #[test]
    fn health_url_normalisation() {
        assert_eq!(health_url("http://localhost:80"), "http://localhost:80/health");
        assert_eq!(health_url("http://localhost:80/"), "http://localhost:80/health");
        assert_eq!(health_url("http://h/health"), "http://h/health");
    }

    #[tokio::test]
    async fn hung_check_is_unhealthy() {
        assert!(!probe(Arc::new(Hangs)).is_healthy().await);
    }

    #[tokio::test]
    async fn wait_observes_recovery() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_for: 3,
        });
        let p = probe(flaky.clone());
        assert!(p.wait_until_healthy(Duration::from_secs(5)).await);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn wait_gives_up_after_max_wait() {
        let start = Instant::now();
        let recovered = probe(Arc::new(StaticHealth(false)))
            .wait_until_healthy(Duration::from_millis(30))
            .await;
        assert!(!recovered);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn unreachable_http_backend_is_unhealthy() {
        // Port 9 (discard) is closed on test machines; connection refused.
        let check = HttpHealthCheck::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(!probe(Arc::new(check)).is_healthy().await);
    }

    #[test]
    fn report_strings() {
        assert_eq!(HealthReport::from_probe(false).status, "degraded");
        assert_eq!(HealthReport::from_probe(true).backend, "available");
    }
}
