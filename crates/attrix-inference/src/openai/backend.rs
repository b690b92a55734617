//! OpenAI-compatible vision backend implementation.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use tracing::{debug, info, warn};

use attrix_core::defaults::{
    VISION_BASE_URL, VISION_MAX_TOKENS, VISION_MODEL, VISION_TIMEOUT_SECS,
};
use attrix_core::{Error, Result};

use super::error::{to_attrix_error, VisionErrorCode};
use super::types::*;
use crate::vision::{VisionBackend, VisionReply};

/// User-turn text accompanying the image.
const USER_PROMPT: &str = "Analyze this product image and return the attribute JSON.";

/// Configuration for the OpenAI-compatible vision backend.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    /// Base URL for the API endpoint.
    pub base_url: String,
    /// API key for authentication (optional for local endpoints).
    pub api_key: Option<String>,
    /// Vision-capable model.
    pub model: String,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
    /// Completion token cap.
    pub max_tokens: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: VISION_BASE_URL.to_string(),
            api_key: None,
            model: VISION_MODEL.to_string(),
            timeout_seconds: VISION_TIMEOUT_SECS,
            max_tokens: VISION_MAX_TOKENS,
        }
    }
}

impl VisionConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `ATTRIX_VISION_BASE_URL` | `https://api.openai.com/v1` | API endpoint |
    /// | `ATTRIX_VISION_API_KEY` | `OPENAI_API_KEY` | API key |
    /// | `ATTRIX_VISION_MODEL` | `gpt-4o-mini` | Vision model |
    /// | `ATTRIX_VISION_TIMEOUT_SECS` | `120` | Per-request timeout |
    /// | `ATTRIX_VISION_MAX_TOKENS` | `4096` | Completion token cap |
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("ATTRIX_VISION_BASE_URL")
                .unwrap_or_else(|_| VISION_BASE_URL.to_string()),
            api_key: std::env::var("ATTRIX_VISION_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok()
                .filter(|k| !k.is_empty()),
            model: std::env::var("ATTRIX_VISION_MODEL")
                .unwrap_or_else(|_| VISION_MODEL.to_string()),
            timeout_seconds: std::env::var("ATTRIX_VISION_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(VISION_TIMEOUT_SECS),
            max_tokens: std::env::var("ATTRIX_VISION_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(VISION_MAX_TOKENS),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Vision backend speaking the OpenAI chat completions protocol.
pub struct OpenAiVisionBackend {
    client: Client,
    config: VisionConfig,
}

impl OpenAiVisionBackend {
    /// Create a new backend with the given configuration.
    pub fn new(config: VisionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            base_url = %config.base_url,
            model = %config.model,
            "Initializing vision backend"
        );

        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(VisionConfig::from_env())
    }

    /// Get the current configuration.
    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.api_key {
            Some(ref api_key) => req.header("Authorization", format!("Bearer {}", api_key)),
            None => req,
        }
    }

    fn build_request(&self, image_data: &[u8], mime_type: &str, instructions: &str) -> VisionChatRequest {
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(image_data);
        VisionChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                VisionMessage::system(instructions),
                VisionMessage::user_parts(vec![
                    ContentPart::Text {
                        text: USER_PROMPT.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: format!("data:{};base64,{}", mime_type, image_b64),
                            detail: Some("high".to_string()),
                        },
                    },
                ]),
            ],
            temperature: Some(0.0),
            max_tokens: Some(self.config.max_tokens),
            response_format: Some(ResponseFormat::json_object()),
        }
    }
}

#[async_trait]
impl VisionBackend for OpenAiVisionBackend {
    async fn analyze(
        &self,
        image_data: &[u8],
        mime_type: &str,
        instructions: &str,
    ) -> Result<VisionReply> {
        debug!(
            model = %self.config.model,
            image_bytes = image_data.len(),
            prompt_len = instructions.len(),
            "Sending vision request"
        );

        let request = self.build_request(image_data, mime_type, instructions);
        let response = self
            .authorize(self.client.post(self.url("/chat/completions")))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (message, classifier) = match serde_json::from_str::<OpenAIErrorResponse>(&body) {
                Ok(parsed) => {
                    let classifier = parsed.error.classifier().to_string();
                    (parsed.error.message, classifier)
                }
                Err(_) => (body, String::new()),
            };
            let code = VisionErrorCode::from_response(status.as_u16(), &classifier);
            warn!(status = status.as_u16(), ?code, %message, "Vision request failed");
            return Err(to_attrix_error(code, status.as_u16(), &message));
        }

        let body = response.text().await?;
        let result: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| Error::MalformedResponse(format!("Invalid completion envelope: {}", e)))?;

        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::MalformedResponse("Completion has no content".to_string()))?;

        let tokens_used = result.usage.map(|u| u.total_tokens).unwrap_or(0);
        let model = result.model.unwrap_or_else(|| self.config.model.clone());

        debug!(tokens_used, response_len = content.len(), "Vision request complete");
        Ok(VisionReply {
            content,
            tokens_used,
            model,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .authorize(self.client.get(self.url("/models")))
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "Vision health check failed");
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "Vision health check failed");
                Ok(false)
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VisionConfig::default();
        assert_eq!(config.base_url, VISION_BASE_URL);
        assert_eq!(config.model, VISION_MODEL);
        assert_eq!(config.timeout_seconds, VISION_TIMEOUT_SECS);
        assert_eq!(config.max_tokens, VISION_MAX_TOKENS);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = VisionConfig::default()
            .with_base_url("http://localhost:8080/v1")
            .with_api_key("test-key")
            .with_model("llava")
            .with_timeout(30);

        assert_eq!(config.base_url, "http://localhost:8080/v1");
        assert_eq!(config.api_key.as_deref(), Some("test-key"));
        assert_eq!(config.model, "llava");
        assert_eq!(config.timeout_seconds, 30);
    }

    #[test]
    fn test_url_trims_trailing_slash() {
        let backend =
            OpenAiVisionBackend::new(VisionConfig::default().with_base_url("http://x/v1/"))
                .unwrap();
        assert_eq!(backend.url("/chat/completions"), "http://x/v1/chat/completions");
    }

    #[test]
    fn test_build_request_embeds_data_url() {
        let backend = OpenAiVisionBackend::new(VisionConfig::default()).unwrap();
        let request = backend.build_request(b"abc", "image/png", "instructions");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], VISION_MODEL);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "instructions");
        assert_eq!(
            json["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,YWJj"
        );
        assert_eq!(json["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_model_name_accessor() {
        let backend =
            OpenAiVisionBackend::new(VisionConfig::default().with_model("qwen2.5-vl")).unwrap();
        assert_eq!(backend.model_name(), "qwen2.5-vl");
    }
}
