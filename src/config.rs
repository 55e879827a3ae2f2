//! Configuration types for the admission-controlled pool.
//!
//! All knobs are static at process start. [`PoolConfig`] covers the
//! scheduling core (worker count, backend permits, retry budget, health
//! waits); [`RasterConfig`] and [`VlmConfig`] cover the two concrete phases
//! shipped with the crate.
//!
//! Builders clamp obviously-wrong values and `build()` rejects the rest, so a
//! constructed config is always usable without further checks.

use crate::error::PoolError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Scheduling and retry configuration for an [`crate::executor::Executor`].
///
/// # Example
/// ```rust
/// use pdf2md_pool::PoolConfig;
///
/// let config = PoolConfig::builder()
///     .pool_size(2)
///     .backend_concurrency(2)
///     .max_retries(2)
///     .build()
///     .unwrap();
/// assert_eq!(config.pool_size, 2);
/// ```
#[derive(Clone)]
pub struct PoolConfig {
    /// Number of parallel workers. Default: 4.
    ///
    /// Both phases are compute-bound on one side or the other (pdfium locally,
    /// GPU inference remotely), so this stays in single digits. Extra
    /// submissions queue FIFO until a worker frees up.
    pub pool_size: usize,

    /// Maximum in-flight backend calls process-wide. Default: 2.
    ///
    /// Keep this under the backend's safe concurrent-load threshold; beyond
    /// it the backend starts rejecting or timing out every request at once.
    pub backend_concurrency: usize,

    /// Retries after the first attempt. Default: 2 (three attempts total).
    pub max_retries: u32,

    /// Base delay between attempts in milliseconds. Default: 2000.
    pub retry_backoff_ms: u64,

    /// How the delay evolves across attempts. Default: [`BackoffPolicy::Fixed`].
    pub backoff: BackoffPolicy,

    /// Longest wait for the backend to recover before an attempt. Default: 60.
    pub health_wait_secs: u64,

    /// Interval between health polls while waiting. Default: 2000.
    pub health_poll_interval_ms: u64,

    /// Timeout of a single health probe. Default: 5.
    pub health_timeout_secs: u64,

    /// Upper bound on permit wait plus one remote call, in seconds. Default: 300.
    pub api_timeout_secs: u64,

    /// Directory under which per-request scratch areas are created.
    /// If None, uses the system temp directory.
    pub scratch_root: Option<PathBuf>,

    /// Receives per-request lifecycle events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            backend_concurrency: 2,
            max_retries: 2,
            retry_backoff_ms: 2000,
            backoff: BackoffPolicy::default(),
            health_wait_secs: 60,
            health_poll_interval_ms: 2000,
            health_timeout_secs: 5,
            api_timeout_secs: 300,
            scratch_root: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("pool_size", &self.pool_size)
            .field("backend_concurrency", &self.backend_concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("backoff", &self.backoff)
            .field("health_wait_secs", &self.health_wait_secs)
            .field("health_poll_interval_ms", &self.health_poll_interval_ms)
            .field("health_timeout_secs", &self.health_timeout_secs)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("scratch_root", &self.scratch_root)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn WorkProgressCallback>"),
            )
            .finish()
    }
}

impl PoolConfig {
    /// Create a new builder for `PoolConfig`.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder {
            config: Self::default(),
        }
    }

    /// Delay to sleep after the failed attempt with the given 0-based index.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff.delay(self.retry_backoff_ms, attempt)
    }

    pub fn health_wait(&self) -> Duration {
        Duration::from_secs(self.health_wait_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Builder for [`PoolConfig`].
#[derive(Debug)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn pool_size(mut self, n: usize) -> Self {
        self.config.pool_size = n;
        self
    }

    pub fn backend_concurrency(mut self, n: usize) -> Self {
        self.config.backend_concurrency = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.backoff = policy;
        self
    }

    pub fn health_wait_secs(mut self, secs: u64) -> Self {
        self.config.health_wait_secs = secs;
        self
    }

    pub fn health_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.health_poll_interval_ms = ms.max(1);
        self
    }

    pub fn health_timeout_secs(mut self, secs: u64) -> Self {
        self.config.health_timeout_secs = secs.max(1);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.scratch_root = Some(root.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PoolConfig, PoolError> {
        let c = &self.config;
        if c.pool_size == 0 {
            return Err(PoolError::InvalidConfig("Pool size must be ≥ 1".into()));
        }
        if c.backend_concurrency == 0 {
            return Err(PoolError::InvalidConfig(
                "Backend concurrency must be ≥ 1".into(),
            ));
        }
        if let BackoffPolicy::Exponential { max_ms } = c.backoff {
            if max_ms < c.retry_backoff_ms {
                return Err(PoolError::InvalidConfig(format!(
                    "Exponential backoff cap ({max_ms}ms) is below the base delay ({}ms)",
                    c.retry_backoff_ms
                )));
            }
        }
        Ok(self.config)
    }
}

/// Delay schedule between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Same delay after every failed attempt. (default)
    #[default]
    Fixed,
    /// `base * 2^attempt`, capped at `max_ms`.
    Exponential { max_ms: u64 },
}

impl BackoffPolicy {
    /// Delay after the failed attempt with 0-based index `attempt`.
    pub fn delay(&self, base_ms: u64, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed => Duration::from_millis(base_ms),
            BackoffPolicy::Exponential { max_ms } => {
                let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

// ── Local phase ──────────────────────────────────────────────────────────

/// Configuration for [`crate::pipeline::rasterise::PdfiumRasteriser`].
#[derive(Debug, Clone)]
pub struct RasterConfig {
    /// Maximum rendered image dimension in pixels. Default: 2000.
    ///
    /// Caps either edge so an oversized page (posters, plans) cannot exhaust
    /// memory inside the serialised local phase.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Pages to render. Default: every page.
    pub pages: PageRange,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            max_rendered_pixels: 2000,
            password: None,
            pages: PageRange::default(),
        }
    }
}

/// A contiguous 0-based page window: `start..end`, or `start..` when `end`
/// is None.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: Option<usize>,
}

impl PageRange {
    pub fn new(start: usize, end: Option<usize>) -> Self {
        Self { start, end }
    }

    /// Clip the window to a document of `total_pages` pages.
    pub fn to_indices(&self, total_pages: usize) -> std::ops::Range<usize> {
        let end = self.end.unwrap_or(total_pages).min(total_pages);
        let start = self.start.min(end);
        start..end
    }
}

// ── Remote phase ─────────────────────────────────────────────────────────

/// Configuration for [`crate::pipeline::vlm::VlmBackend`].
#[derive(Clone)]
pub struct VlmConfig {
    /// LLM model identifier. If None, uses "gpt-4.1-nano".
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens generated per page. Default: 4096.
    pub max_tokens: usize,

    /// Custom system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Separator between pages in the assembled document.
    pub page_separator: PageSeparator,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            system_prompt: None,
            page_separator: PageSeparator::default(),
        }
    }
}

impl fmt::Debug for VlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VlmConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("page_separator", &self.page_separator)
            .finish()
    }
}

/// How pages are joined in the assembled Markdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSeparator {
    /// Blank line only. (default)
    #[default]
    None,
    /// "---" between pages.
    HorizontalRule,
    /// "<!-- page N -->" before every page after the first.
    Comment,
}

impl PageSeparator {
    /// Separator placed before the page with 1-based number `page_num`.
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n".to_string(),
            PageSeparator::HorizontalRule => "\n---\n\n".to_string(),
            PageSeparator::Comment => format!("\n<!-- page {page_num} -->\n\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PoolConfig::default();
        assert_eq!(c.max_retries, 2);
        assert_eq!(c.retry_backoff_ms, 2000);
        assert_eq!(c.health_wait_secs, 60);
        assert_eq!(c.health_timeout_secs, 5);
        assert_eq!(c.backoff, BackoffPolicy::Fixed);
    }

    #[test]
    fn zero_pool_size_rejected() {
        let err = PoolConfig::builder().pool_size(0).build().unwrap_err();
        assert!(err.to_string().contains("Pool size"));
    }

    #[test]
    fn zero_backend_concurrency_rejected() {
        assert!(PoolConfig::builder().backend_concurrency(0).build().is_err());
    }

    #[test]
    fn exponential_cap_below_base_rejected() {
        let r = PoolConfig::builder()
            .retry_backoff_ms(1000)
            .backoff(BackoffPolicy::Exponential { max_ms: 10 })
            .build();
        assert!(r.is_err());
    }

    #[test]
    fn fixed_backoff_does_not_grow() {
        let c = PoolConfig::builder().retry_backoff_ms(250).build().unwrap();
        assert_eq!(c.backoff_for(0), Duration::from_millis(250));
        assert_eq!(c.backoff_for(5), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles_then_caps() {
        let p = BackoffPolicy::Exponential { max_ms: 3000 };
        assert_eq!(p.delay(500, 0), Duration::from_millis(500));
        assert_eq!(p.delay(500, 1), Duration::from_millis(1000));
        assert_eq!(p.delay(500, 2), Duration::from_millis(2000));
        assert_eq!(p.delay(500, 3), Duration::from_millis(3000));
        assert_eq!(p.delay(500, 60), Duration::from_millis(3000));
    }

    #[test]
    fn page_range_clips_to_document() {
        assert_eq!(PageRange::default().to_indices(3), 0..3);
        assert_eq!(PageRange::new(1, Some(10)).to_indices(4), 1..4);
        assert_eq!(PageRange::new(7, None).to_indices(4), 4..4);
    }

    #[test]
    fn separator_render() {
        assert_eq!(PageSeparator::Comment.render(3), "\n<!-- page 3 -->\n\n");
        assert_eq!(PageSeparator::HorizontalRule.render(2), "\n---\n\n");
    }
}
