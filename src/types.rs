// src/types.rs

use crate::error::{Result, RotatorError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static MODEL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]+/.+$").expect("model id regex is valid"));

/// A `provider/model_name` pair. The provider prefix selects the key pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelId {
    pub provider: String,
    pub name: String,
}

impl ModelId {
    /// Splits a `provider/model_name` string. The model part may itself
    /// contain slashes (e.g. `openrouter/google/gemini-2.0-flash`).
    pub fn parse(model: &str) -> Result<Self> {
        if !MODEL_ID_RE.is_match(model) {
            return Err(RotatorError::InvalidModel {
                model: model.to_string(),
            });
        }
        let (provider, name) = model
            .split_once('/')
            .expect("regex guarantees a separator");
        Ok(Self {
            provider: provider.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A logical completion request. `params` carries arbitrary provider
/// parameters verbatim (temperature, top_p, tools, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            params: Map::new(),
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Concatenated message text, used for token estimation.
    pub fn prompt_text(&self) -> String {
        let mut text = String::new();
        for message in &self.messages {
            text.push_str(&message.content);
            text.push('\n');
        }
        text
    }
}

/// A logical embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: EmbeddingInput,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl EmbeddingRequest {
    pub fn new(model: impl Into<String>, input: EmbeddingInput) -> Self {
        Self {
            model: model.into(),
            input,
            params: Map::new(),
        }
    }
}

/// Embedding input: a single string or a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

impl From<&str> for EmbeddingInput {
    fn from(s: &str) -> Self {
        Self::Single(s.to_string())
    }
}

/// Token counts reported by a provider for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A non-streaming completion in the provider's native shape, with the
/// fields the engine itself needs lifted out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An embedding response in the provider's native shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub data: Value,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_and_model() {
        let id = ModelId::parse("openai/gpt-4o").unwrap();
        assert_eq!(id.provider, "openai");
        assert_eq!(id.name, "gpt-4o");
    }

    #[test]
    fn keeps_slashes_in_model_name() {
        let id = ModelId::parse("openrouter/google/gemini-2.0-flash").unwrap();
        assert_eq!(id.provider, "openrouter");
        assert_eq!(id.name, "google/gemini-2.0-flash");
    }

    #[test]
    fn rejects_missing_provider() {
        assert!(ModelId::parse("gpt-4o").is_err());
        assert!(ModelId::parse("/gpt-4o").is_err());
        assert!(ModelId::parse("OpenAI/gpt-4o").is_err());
    }

    #[test]
    fn completion_request_flattens_params() {
        let req = CompletionRequest::new("openai/gpt-4o", vec![Message::user("hi")])
            .with_param("temperature", serde_json::json!(0.2));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json.get("temperature"), Some(&serde_json::json!(0.2)));
        let back: CompletionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.params.get("temperature"), Some(&serde_json::json!(0.2)));
    }
}
