//! Workflow orchestrator adapter.
//!
//! A thin client for the external n8n-style orchestrator. Warden uses it two
//! ways: the self-preservation handoff triggers the restart workflow through
//! a webhook, and the LLM's optional `execute_workflow` / `list_workflows`
//! tools go through the same surface.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

/// Client for the workflow orchestrator's HTTP surface.
#[derive(Debug, Clone)]
pub struct WorkflowClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl WorkflowClient {
    /// Create a new client.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Whether the API-key-gated operations are available.
    #[must_use]
    pub const fn has_api_access(&self) -> bool {
        self.api_key.is_some()
    }

    /// Fire a webhook-triggered workflow and return the response body.
    pub async fn trigger_webhook(&self, webhook_path: &str, data: &Value) -> EngineResult<Value> {
        let path = webhook_path.trim_start_matches('/');
        let url = format!("{}/webhook/{path}", self.base_url);

        debug!(url = %url, "Triggering orchestrator webhook");

        let response = self.client.post(&url).json(data).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("orchestrator webhook {path} returned {status}: {body}");
            return Err(if status.is_client_error() {
                EngineError::Permanent(message)
            } else {
                EngineError::Transient(message)
            });
        }

        info!(webhook = path, "Orchestrator webhook triggered");
        Ok(response.json().await.unwrap_or(Value::Null))
    }

    /// Run a named workflow through its webhook path.
    pub async fn run_workflow(&self, workflow_name: &str, data: &Value) -> EngineResult<Value> {
        self.trigger_webhook(workflow_name, data).await
    }

    /// List workflows via the orchestrator API. Requires the API key.
    pub async fn list_workflows(&self) -> EngineResult<Value> {
        let Some(api_key) = &self.api_key else {
            return Err(EngineError::Permanent(
                "orchestrator API key not configured".to_string(),
            ));
        };

        let response = self
            .client
            .get(format!("{}/api/v1/workflows", self.base_url))
            .header("X-N8N-API-KEY", api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Transient(format!(
                "orchestrator workflow list returned {status}: {body}"
            )));
        }

        Ok(response.json().await?)
    }

    /// Check if the orchestrator is reachable.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_trigger_webhook_posts_payload() {
        let server = MockServer::start().await;
        let payload = serde_json::json!({"handoff_id": "sp-abc123"});

        Mock::given(method("POST"))
            .and(path("/webhook/warden-self-restart"))
            .and(body_json(&payload))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"execution_id": "42"})),
            )
            .mount(&server)
            .await;

        let client = WorkflowClient::new(&server.uri(), None);
        let result = client
            .trigger_webhook("warden-self-restart", &payload)
            .await
            .unwrap();
        assert_eq!(result["execution_id"], "42");
    }

    #[tokio::test]
    async fn test_webhook_5xx_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook/broken"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = WorkflowClient::new(&server.uri(), None);
        let err = client
            .trigger_webhook("broken", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_workflows_requires_api_key() {
        let client = WorkflowClient::new("http://localhost:5678", None);
        let err = client.list_workflows().await.unwrap_err();
        assert!(matches!(err, EngineError::Permanent(_)));
    }
}
