//! LLM providers
//!
//! Narrow request/response interfaces for the two paid external calls the bot
//! makes: text completion and image generation.

mod common;
mod http_utils;
/// OpenAI-backed implementation of both provider traits
pub mod openai;

use async_trait::async_trait;
use thiserror::Error;

pub use openai::OpenAiProvider;

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// Error returned by the provider's API
    #[error("API error: {0}")]
    ApiError(String),
    /// Error during network communication
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    JsonError(String),
    /// Missing provider configuration or API key
    #[error("Missing client/API key: {0}")]
    MissingConfig(String),
    /// Any other unexpected error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Text completion provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Complete `user_text` under the given system instruction, without history
    async fn complete(&self, system_prompt: &str, user_text: &str) -> Result<String, LlmError>;
}

/// Image generation provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Generate a single square image and return its raw bytes.
    ///
    /// An empty vector means the provider answered without any image.
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, LlmError>;
}
