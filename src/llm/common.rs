//! Common utilities for LLM providers
//!
//! Helpers for building chat messages and parsing responses of
//! OpenAI-compatible APIs.

use super::LlmError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionResponse,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;

/// Build the two-message conversation sent for every text reply
///
/// # Errors
///
/// Returns `LlmError::Unknown` if message building fails.
pub fn build_openai_messages(
    system_prompt: &str,
    user_message: &str,
) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    Ok(vec![
        ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt)
            .build()
            .map_err(|e| LlmError::Unknown(e.to_string()))?
            .into(),
        ChatCompletionRequestUserMessageArgs::default()
            .content(user_message)
            .build()
            .map_err(|e| LlmError::Unknown(e.to_string()))?
            .into(),
    ])
}

/// Extract text content from an OpenAI-compatible chat completion response
///
/// # Errors
///
/// Returns `LlmError::ApiError` if the response is empty.
pub fn extract_openai_response(
    response: &CreateChatCompletionResponse,
) -> Result<String, LlmError> {
    response
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .ok_or_else(|| LlmError::ApiError("Empty response".to_string()))
}

#[derive(Deserialize, Debug)]
struct ImageData {
    b64_json: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

/// Decode the first inline image of an `images/generations` response.
///
/// A response without entries decodes to an empty vector.
///
/// # Errors
///
/// Returns `LlmError::JsonError` if the body has an unexpected shape and
/// `LlmError::ApiError` if the image payload is not valid base64.
pub fn decode_image_response(body: serde_json::Value) -> Result<Vec<u8>, LlmError> {
    let parsed: ImagesResponse =
        serde_json::from_value(body).map_err(|e| LlmError::JsonError(e.to_string()))?;

    let Some(first) = parsed.data.into_iter().next() else {
        return Ok(Vec::new());
    };
    let Some(encoded) = first.b64_json else {
        return Ok(Vec::new());
    };
    BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| LlmError::ApiError(format!("Invalid image payload: {e}")))
}
