use std::env;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::util::strip_code_fences;

pub mod error;

use error::{LlmError, Result};

pub const API_KEY_ENV: &str = "STRATAGEM_LLM_API_KEY";
pub const MODEL_ENV: &str = "STRATAGEM_LLM_MODEL";
pub const BASE_URL_ENV: &str = "STRATAGEM_LLM_BASE_URL";

const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
}

/// Chat-completion client. `chat_json` adds a JSON-only system hint,
/// strips markdown fences from the reply, and parses it; empty or
/// unparseable content is an `InvalidResponse`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<ChatResponse>;

    async fn chat_json(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<(Value, ChatResponse)> {
        let mut messages = messages.to_vec();
        messages.push(ChatMessage::system(
            "You must respond with valid JSON only. No markdown, no code blocks, just raw JSON.",
        ));

        let response = self.chat(&messages, temperature, max_tokens).await?;

        if response.content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                reason: "empty content".to_string(),
            });
        }

        let stripped = strip_code_fences(&response.content);
        let value = serde_json::from_str(stripped).map_err(|e| LlmError::InvalidResponse {
            reason: format!("invalid JSON: {e}"),
        })?;

        Ok((value, response))
    }
}

/// Client for an OpenAI-compatible chat-completions endpoint (Groq by
/// default).
pub struct GroqClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GroqClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Builds a client from the environment; fails when the API key is
    /// absent so callers can fall back to deterministic behaviour.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var(API_KEY_ENV).map_err(|_| LlmError::MissingApiKey {
            key_env: API_KEY_ENV,
        })?;
        let model = env::var(MODEL_ENV).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let base_url = env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            base_url,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LlmClient for GroqClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<ChatResponse> {
        debug!(model = %self.model, messages = messages.len(), "sending chat request");

        let url = format!("{}/chat/completions", self.base_url);
        let payload: Value = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "temperature": temperature,
                "max_tokens": max_tokens,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let choice = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .ok_or_else(|| LlmError::InvalidResponse {
                reason: "missing choices".to_string(),
            })?;

        let content = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let usage = payload
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            model: payload
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&self.model)
                .to_string(),
            usage,
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedClient {
        reply: String,
    }

    #[async_trait]
    impl LlmClient for CannedClient {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _temperature: f64,
            _max_tokens: u32,
        ) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: self.reply.clone(),
                model: "canned".to_string(),
                usage: Usage::default(),
                finish_reason: "stop".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn chat_json_parses_raw_json() {
        let client = CannedClient {
            reply: r#"{"confidence": 0.8}"#.to_string(),
        };
        let (value, _) = client.chat_json(&[], 0.3, 256).await.unwrap();
        assert_eq!(value["confidence"], 0.8);
    }

    #[tokio::test]
    async fn chat_json_strips_markdown_fences() {
        let client = CannedClient {
            reply: "```json\n{\"confidence\": 0.8}\n```".to_string(),
        };
        let (value, _) = client.chat_json(&[], 0.3, 256).await.unwrap();
        assert_eq!(value["confidence"], 0.8);
    }

    #[tokio::test]
    async fn chat_json_rejects_empty_and_garbage() {
        let client = CannedClient {
            reply: String::new(),
        };
        assert!(matches!(
            client.chat_json(&[], 0.3, 256).await,
            Err(LlmError::InvalidResponse { .. })
        ));

        let client = CannedClient {
            reply: "not json at all".to_string(),
        };
        assert!(matches!(
            client.chat_json(&[], 0.3, 256).await,
            Err(LlmError::InvalidResponse { .. })
        ));
    }
}
