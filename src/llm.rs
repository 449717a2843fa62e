//! Chat-completion provider abstraction.
//!
//! Defines the [`CompletionProvider`] trait and the one production
//! implementation:
//! - **[`OpenAiCompatProvider`]**: POSTs to an OpenAI-compatible
//!   `/v1/chat/completions` endpoint (SiliconFlow, DeepSeek, Moonshot, …).
//!
//! A provider makes exactly one attempt per call and classifies the failure;
//! retries belong to [`RetryPolicy`](crate::retry::RetryPolicy).
//!
//! # Error classification
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → [`CallError::Transient`]
//! - other HTTP 4xx → [`CallError::Fatal`]
//! - network errors and timeouts → [`CallError::Transient`]
//! - a 2xx response without `choices[0].message.content` → [`CallError::Fatal`]

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::models::ChatRequest;
use crate::retry::CallError;

/// Anything that turns a chat request into response text.
pub trait CompletionProvider {
    /// Returns the provider's default model identifier.
    fn model_name(&self) -> &str;

    /// Send one request and return the assistant message content.
    fn complete(&self, request: &ChatRequest) -> Result<String, CallError>;
}

/// Provider for OpenAI-compatible chat-completion endpoints.
///
/// Reads the bearer token from the environment variable named by
/// `llm.api_key_env`.
pub struct OpenAiCompatProvider {
    client: reqwest::blocking::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatProvider {
    /// Create a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key variable is unset or the HTTP client
    /// cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
        })
    }
}

impl CompletionProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &ChatRequest) -> Result<String, CallError> {
        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .map_err(|e| CallError::Transient(format!("request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().unwrap_or_default();
            let msg = format!("API error {}: {}", status, body_text);
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(CallError::Transient(msg));
            }
            return Err(CallError::Fatal(msg));
        }

        let json: serde_json::Value = resp
            .json()
            .map_err(|e| CallError::Transient(format!("failed to read response body: {}", e)))?;
        parse_completion(&json)
    }
}

/// Pull `choices[0].message.content` out of a chat-completion response.
pub fn parse_completion(json: &serde_json::Value) -> Result<String, CallError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            CallError::Fatal("Invalid completion response: missing choices[0].message.content".into())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_completion() {
        let body = json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "{\"a\":1}"}}]
        });
        assert_eq!(parse_completion(&body).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_parse_completion_missing_content() {
        let body = json!({"choices": []});
        assert!(matches!(parse_completion(&body), Err(CallError::Fatal(_))));
    }

    #[test]
    fn test_missing_api_key() {
        let cfg = LlmConfig {
            api_url: "http://127.0.0.1:9/v1/chat/completions".into(),
            api_key_env: "GSYNTH_TEST_UNSET_KEY_VAR".into(),
            model: "m".into(),
            timeout_secs: 1,
            max_retries: 1,
            retry_delay_ms: 0,
            backoff: Default::default(),
            rate_limit_ms: 0,
        };
        let err = OpenAiCompatProvider::new(&cfg).err().unwrap();
        assert!(err.to_string().contains("GSYNTH_TEST_UNSET_KEY_VAR"));
    }
}
