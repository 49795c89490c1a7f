//! The LLM seam.
//!
//! The pipeline talks to the model through [`LlmClient::tool_round`] only;
//! the vendor wire format stays behind this module. [`AnthropicClient`] is
//! the production implementation over the Messages API; tests substitute a
//! scripted stub.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// One message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl Message {
    #[must_use]
    pub fn user_text(text: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
        }
    }

    #[must_use]
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
        }
    }

    #[must_use]
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content: results,
        }
    }
}

/// A content block in a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// One round of model output.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    pub stop_reason: Option<String>,
    pub content: Vec<ContentBlock>,
}

impl LlmResponse {
    /// Concatenated text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool-use blocks, if any.
    #[must_use]
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Minimal interface to the model: one request/response round with tools.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn tool_round(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> EngineResult<LlmResponse>;
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [Message],
    tools: &'a [ToolDefinition],
    /// Deterministic for operational tasks
    temperature: f32,
}

impl AnthropicClient {
    /// Create a new client.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(api_key: &str, model: &str, max_tokens: u32, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: "https://api.anthropic.com".to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
        }
    }

    /// Point the client at a different API host (tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn tool_round(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> EngineResult<LlmResponse> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages,
            tools,
            temperature: 0.0,
        };

        debug!(model = %self.model, message_count = messages.len(), "Sending model request");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("model API returned {status}: {body}");
            // 4xx means our request (or key) is wrong; retrying won't help.
            return Err(if status.is_client_error() {
                EngineError::Permanent(message)
            } else {
                EngineError::Transient(message)
            });
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_text_and_tool_uses() {
        let response: LlmResponse = serde_json::from_value(serde_json::json!({
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "Checking logs. "},
                {"type": "tool_use", "id": "tu_1", "name": "gather_logs",
                 "input": {"host": "forge", "kind": "docker", "name": "caddy"}}
            ]
        }))
        .unwrap();

        assert_eq!(response.text(), "Checking logs. ");
        let uses = response.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "gather_logs");
    }

    #[test]
    fn test_message_round_trip() {
        let msg = Message::assistant(vec![ContentBlock::ToolUse {
            id: "tu_1".to_string(),
            name: "check_service_status".to_string(),
            input: serde_json::json!({"host": "forge", "name": "caddy"}),
        }]);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"][0]["type"], "tool_use");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.content.len(), 1);
    }
}
