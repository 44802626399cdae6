//! LLM integration for the optional rewrite step.
//!
//! A single backend is supported: any OpenAI-compatible chat completion
//! endpoint, selected by base URL.

pub mod openai_compat;
pub mod provider;

pub use openai_compat::OpenAiCompatProvider;
pub use provider::*;

use std::sync::Arc;

use crate::config::TransformConfig;
use crate::error::LlmError;

/// Create an LLM provider from configuration.
///
/// Returns `Ok(None)` when the rewrite step is disabled.
pub fn create_provider(config: &TransformConfig) -> Result<Option<Arc<dyn LlmProvider>>, LlmError> {
    if !config.enabled {
        return Ok(None);
    }

    let api_key = config.api_key.clone().ok_or_else(|| LlmError::AuthFailed {
        provider: "openai-compat".to_string(),
    })?;

    let provider: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatProvider::new(
        &config.base_url,
        api_key,
        &config.model,
        config.timeout,
    )?);
    tracing::info!("Using {} (model: {})", config.base_url, config.model);
    Ok(Some(provider))
}
