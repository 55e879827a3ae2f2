//! The two phases of a unit of work, and the crate's PDF implementations.
//!
//! ```text
//! raw bytes ──▶ Preprocessor ──▶ Output ──▶ InferenceBackend ──▶ WorkOutput
//!              (blocking, gated)            (async, permit-bounded)
//! ```
//!
//! The executor is generic over both traits, so the same admission core runs
//! any "local step then remote step" workload. The bundled implementations:
//!
//! 1. [`rasterise`]: pdfium renders the selected pages to PNG. pdfium is not
//!    reentrant, which is why the local phase runs behind the preprocess gate.
//! 2. [`vlm`]: each page image goes to a vision LLM; replies are cleaned by
//!    [`postprocess`] and joined into one Markdown document.

pub mod postprocess;
pub mod rasterise;
pub mod vlm;

use crate::error::PhaseError;
use crate::output::WorkOutput;
use async_trait::async_trait;
use std::path::Path;

/// The local, CPU-bound phase. Called on the blocking pool, one at a time.
pub trait Preprocessor: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn preprocess(&self, raw: &[u8]) -> Result<Self::Output, PhaseError>;
}

/// The remote phase. At most `backend_concurrency` calls run at once.
///
/// `scratch` is the request's private working directory; it survives across
/// retries of the same request and is removed once the request finishes.
#[async_trait]
pub trait InferenceBackend<I>: Send + Sync + 'static
where
    I: Send + Sync + 'static,
{
    async fn infer(&self, input: &I, scratch: &Path) -> Result<WorkOutput, PhaseError>;
}
