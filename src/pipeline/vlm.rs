//! The remote phase: send rasterised pages to a vision LLM.
//!
//! One call to [`VlmBackend::infer`] is one backend admission. Pages are
//! sent one after another inside it, so a single request never occupies more
//! than one of the backend's concurrency slots however many pages it has.
//!
//! Page images are also written to `<scratch>/images/` so a stuck request can
//! be inspected while it is still live; the scratch area is removed with the
//! request.

use crate::config::VlmConfig;
use crate::error::{PhaseError, PoolError};
use crate::output::WorkOutput;
use crate::pipeline::postprocess::clean_markdown;
use crate::pipeline::rasterise::RasterisedDocument;
use crate::pipeline::InferenceBackend;
use crate::prompts::DEFAULT_SYSTEM_PROMPT;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const DEFAULT_MODEL: &str = "gpt-4.1-nano";

/// Vision-LLM backend over an `edgequake_llm` provider.
pub struct VlmBackend {
    provider: Arc<dyn LLMProvider>,
    config: VlmConfig,
}

impl VlmBackend {
    /// Resolve the provider from `config` and the environment.
    pub fn from_config(config: VlmConfig) -> Result<Self, PoolError> {
        let provider = resolve_provider(&config)?;
        Ok(Self { provider, config })
    }

    pub fn with_provider(provider: Arc<dyn LLMProvider>, config: VlmConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl InferenceBackend<RasterisedDocument> for VlmBackend {
    async fn infer(
        &self,
        doc: &RasterisedDocument,
        scratch: &Path,
    ) -> Result<WorkOutput, PhaseError> {
        let images_dir = scratch.join("images");
        tokio::fs::create_dir_all(&images_dir)
            .await
            .map_err(|e| PhaseError::Inference(format!("scratch: {e}")))?;

        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let options = build_options(&self.config);

        let mut markdown = String::new();
        let mut output = WorkOutput::default();

        for (i, page) in doc.pages.iter().enumerate() {
            let start = Instant::now();
            let image_path = images_dir.join(format!("page-{:04}.png", page.page_num));
            tokio::fs::write(&image_path, &page.png)
                .await
                .map_err(|e| PhaseError::Inference(format!("scratch: {e}")))?;

            let image = ImageData::new(STANDARD.encode(&page.png), "image/png").with_detail("high");
            let messages = vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user_with_images("", vec![image]),
            ];

            let response = self
                .provider
                .chat(&messages, Some(&options))
                .await
                .map_err(|e| PhaseError::Inference(format!("page {}: {e}", page.page_num)))?;

            debug!(
                "Page {}: {} input tokens, {} output tokens, {:?}",
                page.page_num,
                response.prompt_tokens,
                response.completion_tokens,
                start.elapsed()
            );

            if i > 0 {
                markdown.push_str(&self.config.page_separator.render(page.page_num));
            }
            markdown.push_str(&clean_markdown(&response.content));
            output.input_tokens += response.prompt_tokens as u64;
            output.output_tokens += response.completion_tokens as u64;
        }

        output.content = markdown;
        output.units = doc.pages.len();
        Ok(output)
    }
}

fn build_options(config: &VlmConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Resolve the LLM provider, from most-specific to least-specific:
/// pre-built provider, named provider, `EDGEQUAKE_LLM_PROVIDER` +
/// `EDGEQUAKE_MODEL`, then full auto-detection from API-key variables.
fn resolve_provider(config: &VlmConfig) -> Result<Arc<dyn LLMProvider>, PoolError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PoolError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {e}"
            ),
        })?;
    Ok(llm_provider)
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PoolError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        PoolError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config() {
        let config = VlmConfig {
            temperature: 0.0,
            max_tokens: 1024,
            ..Default::default()
        };
        let opts = build_options(&config);
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(1024));
    }
}
