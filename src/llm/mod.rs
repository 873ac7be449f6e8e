//! LLM integration for the pipeline.
//!
//! Supports:
//! - **Vision**: Anthropic Messages API over reqwest (page image → text)
//! - **Text**: Anthropic or OpenAI via rig-core (text → structured fields)
//!
//! Uses the rig-core crate for HTTP transport and the `RigAdapter` to bridge
//! rig's `CompletionModel` trait to our `LlmProvider` trait.

pub mod provider;
mod rig_adapter;
pub mod vision;

pub use provider::{CompletionRequest, LlmProvider};
pub use rig_adapter::RigAdapter;
pub use vision::{AnthropicVision, VisionConfig, VisionModel};

use std::str::FromStr;
use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, LlmError};

const DEFAULT_VISION_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_TEXT_MODEL: &str = "claude-sonnet-4-20250514";

/// Supported text LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(LlmBackend::Anthropic),
            "openai" => Ok(LlmBackend::OpenAi),
            other => Err(format!("unknown LLM backend: {other}")),
        }
    }
}

/// Configuration for creating the text provider and the vision client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    /// Key for the text backend.
    pub api_key: SecretString,
    pub model: String,
    /// Anthropic key used for page vision.
    pub vision_api_key: SecretString,
    pub vision_model: String,
}

impl LlmConfig {
    /// Build config from environment variables.
    ///
    /// `ANTHROPIC_API_KEY` is always required (vision); `OPENAI_API_KEY` is
    /// required as well when the text backend is `openai`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match std::env::var("PIPELINE_LLM_BACKEND") {
            Ok(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "PIPELINE_LLM_BACKEND".into(),
                message,
            })?,
            Err(_) => LlmBackend::Anthropic,
        };

        let anthropic_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;

        let (api_key, default_model) = match backend {
            LlmBackend::Anthropic => (anthropic_key.clone(), DEFAULT_TEXT_MODEL),
            LlmBackend::OpenAi => (
                std::env::var("OPENAI_API_KEY")
                    .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".into()))?,
                "gpt-4o",
            ),
        };

        Ok(Self {
            backend,
            api_key: SecretString::from(api_key),
            model: std::env::var("PIPELINE_TEXT_MODEL").unwrap_or_else(|_| default_model.into()),
            vision_api_key: SecretString::from(anthropic_key),
            vision_model: std::env::var("PIPELINE_VISION_MODEL")
                .unwrap_or_else(|_| DEFAULT_VISION_MODEL.into()),
        })
    }
}

/// Create the text LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_provider(config),
        LlmBackend::OpenAi => create_openai_provider(config),
    }
}

/// Create the page vision client from configuration.
pub fn create_vision(config: &LlmConfig) -> Result<Arc<dyn VisionModel>, LlmError> {
    let vision = AnthropicVision::new(VisionConfig::new(
        config.vision_api_key.clone(),
        config.vision_model.clone(),
    ))?;
    Ok(Arc::new(vision))
}

fn create_anthropic_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "anthropic")))
}

fn create_openai_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "openai")))
}
