//! Bridges a rig `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{CompletionModel, Prompt};

use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, LlmProvider};

/// `LlmProvider` backed by any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
}

impl<M> RigAdapter<M>
where
    M: CompletionModel,
{
    pub fn new(model: M, model_name: &str, provider: &'static str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
        }
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let agent = AgentBuilder::new(self.model.clone())
            .preamble(&request.system)
            .temperature(request.temperature)
            .max_tokens(request.max_tokens)
            .build();

        agent
            .prompt(request.prompt.as_str())
            .await
            .map_err(|e| classify_error(self.provider, &e.to_string()))
    }
}

/// Map a rig error message onto our error taxonomy.
///
/// rig flattens HTTP failures into strings, so the status code is recovered
/// from the message text.
pub(crate) fn classify_error(provider: &str, message: &str) -> LlmError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("overloaded") {
        LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after: None,
        }
    } else if lower.contains("401") || lower.contains("403") || lower.contains("authentication")
    {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else if lower.contains("400") || lower.contains("invalid_request") {
        LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    }
}
