use super::common::{build_openai_messages, decode_image_response, extract_openai_response};
use super::http_utils::{create_http_client, send_json_request};
use super::{ImageProvider, LlmError, TextProvider};
use crate::config::Settings;
use async_openai::{config::OpenAIConfig, types::chat::CreateChatCompletionRequestArgs, Client};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::json;
use tracing::debug;

/// OpenAI provider serving both chat completions and image generation
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    http_client: HttpClient,
    api_key: String,
    api_base: String,
    chat_model: String,
    image_model: String,
    image_size: String,
}

impl OpenAiProvider {
    /// Create a new provider from settings
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingConfig` if the HTTP client cannot be built
    /// (e.g. an invalid proxy URL).
    pub fn new(settings: &Settings) -> Result<Self, LlmError> {
        let http_client = create_http_client(settings.proxy_url().as_deref())?;
        let config = OpenAIConfig::new()
            .with_api_key(settings.openai_api_key.clone())
            .with_api_base(settings.openai_api_base.clone());
        Ok(Self {
            client: Client::with_config(config).with_http_client(http_client.clone()),
            http_client,
            api_key: settings.openai_api_key.clone(),
            api_base: settings.openai_api_base.trim_end_matches('/').to_string(),
            chat_model: settings.gpt_model.clone(),
            image_model: settings.dall_e_model.clone(),
            image_size: settings.image_size.clone(),
        })
    }
}

#[async_trait]
impl TextProvider for OpenAiProvider {
    async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<String, LlmError> {
        let messages = build_openai_messages(system_prompt, user_text)?;

        let request = CreateChatCompletionRequestArgs::default()
            .model(self.chat_model.as_str())
            .messages(messages)
            .build()
            .map_err(|e| LlmError::Unknown(e.to_string()))?;

        debug!(model = %self.chat_model, "Sending chat completion request");
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        extract_openai_response(&response)
    }
}

#[async_trait]
impl ImageProvider for OpenAiProvider {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, LlmError> {
        let url = format!("{}/images/generations", self.api_base);
        let body = json!({
            "model": self.image_model,
            "prompt": prompt,
            "n": 1,
            "size": self.image_size,
            "response_format": "b64_json",
        });

        debug!(model = %self.image_model, size = %self.image_size, "Sending image generation request");
        let auth = format!("Bearer {}", self.api_key);
        let response = send_json_request(&self.http_client, &url, &body, Some(&auth)).await?;

        decode_image_response(response)
    }
}
