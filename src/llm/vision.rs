//! Vision extraction: page image in, text out.
//!
//! Talks to the Anthropic Messages API directly over reqwest: one user turn
//! holding a base64 image block followed by the extraction instructions.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::LlmError;

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// System prompt shared by every page request.
const SYSTEM_PROMPT: &str = "You transcribe images of business documents such as quotations, \
enquiry forms and site information sheets. Reproduce only what is visible on the page. \
Never invent values.";

/// Turns one page image into text.
#[async_trait]
pub trait VisionModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Extract the content of one page image following `instructions`.
    async fn extract_page(
        &self,
        image: &[u8],
        media_type: &str,
        instructions: &str,
    ) -> Result<String, LlmError>;
}

/// Configuration for the Anthropic vision client.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl VisionConfig {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: 8192,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Anthropic Messages API vision client.
pub struct AnthropicVision {
    client: reqwest::Client,
    config: VisionConfig,
}

impl AnthropicVision {
    pub fn new(config: VisionConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        tracing::info!("Using Anthropic vision (model: {})", config.model);
        Ok(Self { client, config })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl VisionModel for AnthropicVision {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn extract_page(
        &self,
        image: &[u8],
        media_type: &str,
        instructions: &str,
    ) -> Result<String, LlmError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": SYSTEM_PROMPT,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": media_type,
                            "data": base64::engine::general_purpose::STANDARD.encode(image),
                        }
                    },
                    { "type": "text", "text": instructions }
                ]
            }]
        });

        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.config.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(status_error(status, retry_after, &text));
        }

        let page = parse_response_text(&text)?;
        tracing::debug!(
            model = %self.config.model,
            image_bytes = image.len(),
            chars = page.len(),
            "Vision page extracted"
        );
        Ok(page)
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> LlmError {
    let provider = PROVIDER.to_string();
    match status.as_u16() {
        429 | 529 => LlmError::RateLimited {
            provider,
            retry_after,
        },
        401 | 403 => LlmError::AuthFailed { provider },
        400..=499 => LlmError::InvalidResponse {
            provider,
            reason: format!("HTTP {status}: {}", truncate(body, 300)),
        },
        _ => LlmError::RequestFailed {
            provider,
            reason: format!("HTTP {status}: {}", truncate(body, 300)),
        },
    }
}

/// Concatenate the text blocks of a Messages API response.
fn parse_response_text(body: &str) -> Result<String, LlmError> {
    let parsed: MessagesResponse = serde_json::from_str(body)?;
    let text: Vec<String> = parsed
        .content
        .into_iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text)
        .collect();
    if text.is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "response carried no text blocks".into(),
        });
    }
    Ok(text.join("\n"))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
