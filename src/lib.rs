//! # pdf2md-pool
//!
//! Admission-controlled PDF-to-Markdown conversion against a shared vision
//! model backend.
//!
//! ## Why this crate?
//!
//! A VLM inference server tolerates only a handful of concurrent requests
//! before it starts failing all of them, and pdfium cannot be entered from
//! two threads at once. Accepting many uploads in parallel therefore needs
//! more than a thread pool: each request has to pass a serialised local
//! phase, then a bounded remote phase, and survive the backend restarting in
//! the middle of it.
//!
//! ## Request lifecycle
//!
//! ```text
//! submit ─▶ FIFO queue ─▶ worker (1 of pool_size)
//!                           │
//!                           ├─ acquire scratch area
//!                           ├─ ┌ health probe ─ unhealthy? wait ≤ 60s
//!                           │  ├ preprocess   (1 at a time, process-wide)
//!                           │  ├ inference    (≤ backend_concurrency)
//!                           │  └ failed? back off 2s, retry ≤ max_retries
//!                           ├─ release scratch area
//!                           └─ WorkResult
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2md_pool::{
//!     Executor, HttpHealthCheck, PdfiumRasteriser, PoolConfig, RasterConfig, VlmBackend,
//!     VlmConfig,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PoolConfig::builder().pool_size(4).backend_concurrency(2).build()?;
//!     let health = HttpHealthCheck::new("http://localhost:80", Duration::from_secs(5))?;
//!     let executor = Executor::start(
//!         config,
//!         PdfiumRasteriser::new(RasterConfig::default()),
//!         VlmBackend::from_config(VlmConfig::default())?,
//!         Arc::new(health),
//!     )?;
//!
//!     let result = executor.submit_bytes(std::fs::read("paper.pdf")?, "paper.pdf").await;
//!     match result.output() {
//!         Some(out) => println!("{}", out.content),
//!         None => eprintln!("failed after {} attempts: {:?}", result.attempts, result.error()),
//!     }
//!     executor.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md-pool` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when embedding the pool in a service:
//! ```toml
//! pdf2md-pool = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod health;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod request;
pub mod scratch;
pub mod supervisor;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    BackoffPolicy, PageRange, PageSeparator, PoolConfig, PoolConfigBuilder, RasterConfig,
    VlmConfig,
};
pub use error::{CleanupFailure, FailureKind, PhaseError, PoolError};
pub use executor::Executor;
pub use gate::{BackendGate, PreprocessGate};
pub use health::{HealthCheck, HealthProbe, HealthReport, HttpHealthCheck, StaticHealth};
pub use output::{WorkOutcome, WorkOutput, WorkResult};
pub use pipeline::rasterise::{PdfiumRasteriser, RasterPage, RasterisedDocument};
pub use pipeline::vlm::VlmBackend;
pub use pipeline::{InferenceBackend, Preprocessor};
pub use progress::{NoopProgressCallback, ProgressCallback, WorkProgressCallback};
pub use request::WorkRequest;
pub use scratch::{ScratchArea, ScratchManager, ScratchStats};
pub use supervisor::RetrySupervisor;
