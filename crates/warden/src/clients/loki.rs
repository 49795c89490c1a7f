//! Loki client for aggregated log queries.
//!
//! Gives the LLM centralized log access without SSH. Results are truncated
//! to bounded sizes before they reach model context.

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

/// Configuration for the Loki client.
#[derive(Debug, Clone)]
pub struct LokiConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for LokiConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("LOKI_URL")
                .unwrap_or_else(|_| "http://192.168.0.11:3100".to_string()),
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryRangeResponse {
    data: QueryRangeData,
}

#[derive(Debug, Deserialize)]
struct QueryRangeData {
    result: Vec<LogStream>,
}

#[derive(Debug, Deserialize)]
struct LogStream {
    #[serde(default)]
    stream: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(String, String)>,
}

/// One log line with its stream labels.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp_ns: String,
    pub message: String,
    pub labels: HashMap<String, String>,
}

/// Query Loki for aggregated logs.
#[derive(Debug, Clone)]
pub struct LokiClient {
    config: LokiConfig,
    client: reqwest::Client,
}

impl LokiClient {
    /// Create a new Loki client with the given configuration.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(config: LokiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { config, client }
    }

    /// Create a client pointed at a specific base URL.
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        Self::new(LokiConfig {
            base_url: base_url.to_string(),
            ..LokiConfig::default()
        })
    }

    /// Execute a LogQL range query over the last `minutes` minutes.
    ///
    /// Loki takes its time bounds in nanoseconds.
    pub async fn query_logs(
        &self,
        query: &str,
        minutes: i64,
        limit: u32,
    ) -> EngineResult<Vec<LogEntry>> {
        let end = Utc::now();
        let start = end - chrono::Duration::minutes(minutes);

        let start_ns = start.timestamp_nanos_opt().unwrap_or(0).to_string();
        let end_ns = end.timestamp_nanos_opt().unwrap_or(0).to_string();

        let response = self
            .client
            .get(format!(
                "{}/loki/api/v1/query_range",
                self.config.base_url.trim_end_matches('/')
            ))
            .query(&[
                ("query", query),
                ("start", start_ns.as_str()),
                ("end", end_ns.as_str()),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("Loki returned {status}: {body}");
            return Err(if status.is_client_error() {
                EngineError::Permanent(message)
            } else {
                EngineError::Transient(message)
            });
        }

        let body: QueryRangeResponse = response.json().await?;

        let mut entries = Vec::new();
        for stream in body.data.result {
            for (timestamp_ns, message) in stream.values {
                entries.push(LogEntry {
                    timestamp_ns,
                    message,
                    labels: stream.stream.clone(),
                });
            }
        }

        debug!(
            query = &query[..query.len().min(100)],
            result_count = entries.len(),
            "Loki query completed"
        );
        Ok(entries)
    }

    /// Recent error-level lines from a container, formatted for model input.
    pub async fn container_errors(&self, container: &str, minutes: i64) -> String {
        let query =
            format!(r#"{{container="{container}"}} |~ "(?i)(error|exception|fatal|panic|fail)""#);

        let logs = match self.query_logs(&query, minutes, 50).await {
            Ok(logs) => logs,
            Err(e) => return format!("Failed to query Loki: {e}"),
        };

        if logs.is_empty() {
            return format!("No errors found for {container} in last {minutes} minutes");
        }

        let mut output = vec![format!("Recent errors from {container} (last {minutes}m):")];
        for log in logs.iter().take(20) {
            output.push(format!("  {}", truncate(&log.message, 500)));
        }
        output.join("\n")
    }

    /// Recent logs from a service, any level.
    pub async fn service_logs(&self, service: &str, minutes: i64) -> String {
        let query = format!(r#"{{job=~".*{service}.*"}}"#);

        let logs = match self.query_logs(&query, minutes, 100).await {
            Ok(logs) => logs,
            Err(e) => return format!("Failed to query Loki: {e}"),
        };

        if logs.is_empty() {
            return format!("No logs found for {service} in last {minutes} minutes");
        }

        let mut output = vec![format!("Recent logs from {service}:")];
        for log in logs.iter().take(30) {
            output.push(format!("  {}", truncate(&log.message, 300)));
        }
        output.join("\n")
    }

    /// Free-text pattern search across all jobs.
    pub async fn search_logs(&self, pattern: &str, minutes: i64) -> String {
        let query = format!(r#"{{job=~".+"}} |~ "{pattern}""#);

        let logs = match self.query_logs(&query, minutes, 100).await {
            Ok(logs) => logs,
            Err(e) => return format!("Failed to query Loki: {e}"),
        };

        if logs.is_empty() {
            return format!("No logs matching '{pattern}' in last {minutes} minutes");
        }

        let mut output = vec![format!("Logs matching '{pattern}':")];
        for log in logs.iter().take(25) {
            let job = log
                .labels
                .get("job")
                .map_or("unknown", String::as_str);
            output.push(format!("  [{job}] {}", truncate(&log.message, 400)));
        }
        output.join("\n")
    }

    /// Check if Loki is reachable.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/ready", self.config.base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Loki health check failed");
                false
            }
        }
    }
}

fn truncate(message: &str, max: usize) -> &str {
    if message.len() <= max {
        message
    } else {
        // Back off to a char boundary so multi-byte text cannot panic.
        let mut end = max;
        while end > 0 && !message.is_char_boundary(end) {
            end -= 1;
        }
        &message[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn stream_body(values: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "streams",
                "result": [{
                    "stream": {"container": "caddy", "job": "docker"},
                    "values": values
                }]
            }
        })
    }

    #[tokio::test]
    async fn test_query_logs_parsing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loki/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(stream_body(
                serde_json::json!([
                    ["1700000000000000000", "error: connection refused"],
                    ["1700000001000000000", "error: retrying"]
                ]),
            )))
            .mount(&server)
            .await;

        let client = LokiClient::with_base_url(&server.uri());
        let logs = client
            .query_logs(r#"{container="caddy"}"#, 15, 100)
            .await
            .unwrap();

        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "error: connection refused");
        assert_eq!(logs[0].labels.get("container").unwrap(), "caddy");
    }

    #[tokio::test]
    async fn test_container_errors_formats_output() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loki/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(stream_body(
                serde_json::json!([["1700000000000000000", "panic: out of memory"]]),
            )))
            .mount(&server)
            .await;

        let client = LokiClient::with_base_url(&server.uri());
        let out = client.container_errors("caddy", 15).await;
        assert!(out.contains("Recent errors from caddy"));
        assert!(out.contains("panic: out of memory"));
    }

    #[tokio::test]
    async fn test_backend_error_becomes_message_not_hang() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/loki/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = LokiClient::with_base_url(&server.uri());
        let out = client.service_logs("grafana", 10).await;
        assert!(out.starts_with("Failed to query Loki"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
        assert_eq!(truncate("short", 500), "short");
    }
}
