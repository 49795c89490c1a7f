//! Prometheus client for alert verification and metric queries.
//!
//! Beyond raw instant/range queries, this client carries the two derived
//! operations the pipeline leans on: alert-status lookup (is the alert still
//! firing?) and remediation verification (poll until the alert resolves or
//! the budget runs out). Trend analysis and exhaustion prediction back the
//! `query_metric_history` LLM tool and the proactive monitor.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Configuration for the Prometheus client.
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Base URL for the Prometheus API
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("PROMETHEUS_URL")
                .unwrap_or_else(|_| "http://192.168.0.11:9090".to_string()),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: String,
    #[serde(default)]
    error: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    result: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    metric: HashMap<String, String>,
    /// Instant queries
    value: Option<(f64, String)>,
    /// Range queries
    values: Option<Vec<(f64, String)>>,
}

#[derive(Debug, Deserialize)]
struct AlertsData {
    alerts: Vec<ActiveAlert>,
}

#[derive(Debug, Deserialize)]
struct ActiveAlert {
    labels: HashMap<String, String>,
    state: String,
}

/// A metric sample.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSample {
    pub labels: HashMap<String, String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Summary of a metric's recent behavior.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricTrend {
    pub metric: String,
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Per-sample delta over the window (5-minute steps)
    pub trend: f64,
    pub trend_direction: &'static str,
    pub data_points: usize,
}

/// Exhaustion prediction for a decaying metric.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "prediction", rename_all = "snake_case")]
pub enum ExhaustionPrediction {
    StableOrImproving {
        current: f64,
        trend: f64,
    },
    WillExhaust {
        current: f64,
        threshold: f64,
        hours_remaining: f64,
        trend_per_hour: f64,
    },
}

/// Query Prometheus for alert status and metrics.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    config: PrometheusConfig,
    client: reqwest::Client,
}

impl PrometheusClient {
    /// Create a new Prometheus client with the given configuration.
    ///
    /// # Panics
    /// Panics if the HTTP client cannot be created.
    #[must_use]
    pub fn new(config: PrometheusConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { config, client }
    }

    /// Create a client pointed at a specific base URL.
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        Self::new(PrometheusConfig {
            base_url: base_url.to_string(),
            ..PrometheusConfig::default()
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Execute an instant query.
    pub async fn query(&self, query: &str) -> EngineResult<Vec<MetricSample>> {
        debug!(query, "Executing Prometheus query");

        let response = self
            .client
            .get(self.url("/api/v1/query"))
            .query(&[("query", query)])
            .send()
            .await?;

        let body: ApiResponse<QueryData> = check_status(response).await?.json().await?;
        let data = unwrap_api(body)?;

        Ok(parse_instant(&data.result))
    }

    /// Execute a range query.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: &str,
    ) -> EngineResult<Vec<MetricSample>> {
        debug!(query, %start, %end, step, "Executing Prometheus range query");

        let response = self
            .client
            .get(self.url("/api/v1/query_range"))
            .query(&[
                ("query", query),
                ("start", &start.timestamp().to_string()),
                ("end", &end.timestamp().to_string()),
                ("step", step),
            ])
            .send()
            .await?;

        let body: ApiResponse<QueryData> = check_status(response).await?.json().await?;
        let data = unwrap_api(body)?;

        Ok(parse_range(&data.result))
    }

    /// Check whether an alert is currently firing.
    ///
    /// Returns `"firing"`, `"pending"`, or `"resolved"` (absent from the
    /// active-alert list means resolved).
    pub async fn alert_status(
        &self,
        alert_name: &str,
        instance: Option<&str>,
        labels: Option<&HashMap<String, String>>,
    ) -> EngineResult<String> {
        let response = self.client.get(self.url("/api/v1/alerts")).send().await?;
        let body: ApiResponse<AlertsData> = check_status(response).await?.json().await?;
        let data = unwrap_api(body)?;

        for alert in data.alerts {
            if alert.labels.get("alertname").map(String::as_str) != Some(alert_name) {
                continue;
            }
            if let Some(instance) = instance {
                if alert.labels.get("instance").map(String::as_str) != Some(instance) {
                    continue;
                }
            }
            if let Some(labels) = labels {
                let all_match = labels
                    .iter()
                    .all(|(k, v)| alert.labels.get(k) == Some(v));
                if !all_match {
                    continue;
                }
            }
            return Ok(alert.state);
        }

        Ok("resolved".to_string())
    }

    /// Poll until the alert reports resolved, or the wait budget runs out.
    ///
    /// Sleeps `initial_delay` first so the fix has a chance to take effect,
    /// then checks every `poll_interval`. Backend errors during individual
    /// checks are logged and skipped; only the overall timeout fails the
    /// verification.
    pub async fn verify_remediation(
        &self,
        alert_name: &str,
        instance: Option<&str>,
        labels: Option<&HashMap<String, String>>,
        max_wait: Duration,
        poll_interval: Duration,
        initial_delay: Duration,
    ) -> (bool, String) {
        info!(
            alert_name,
            instance,
            max_wait_secs = max_wait.as_secs(),
            "Starting remediation verification"
        );

        tokio::time::sleep(initial_delay).await;

        let poll_secs = poll_interval.as_secs().max(1);
        let budget = max_wait.as_secs().saturating_sub(initial_delay.as_secs());
        let checks = budget / poll_secs;
        let mut status = "unknown".to_string();
        let mut any_check_succeeded = false;

        for check in 0..checks {
            match self.alert_status(alert_name, instance, labels).await {
                Ok(state) => {
                    any_check_succeeded = true;
                    if state == "resolved" {
                        let elapsed = initial_delay.as_secs() + (check + 1) * poll_secs;
                        info!(alert_name, elapsed_secs = elapsed, "Remediation verified");
                        return (true, format!("Alert resolved after {elapsed}s"));
                    }
                    debug!(alert_name, state = %state, check = check + 1, "Alert still active");
                    status = state;
                }
                Err(e) => {
                    warn!(alert_name, error = %e, check = check + 1, "Verification check failed");
                }
            }

            tokio::time::sleep(poll_interval).await;
        }

        // A backend that never answered is not evidence the fix failed; the
        // exit codes stand in that case.
        if !any_check_succeeded {
            warn!(alert_name, "Verification backend unreachable, trusting exit codes");
            return (
                true,
                "Verification backend unavailable, trusting exit codes".to_string(),
            );
        }

        warn!(alert_name, final_status = %status, "Remediation verification timed out");
        (
            false,
            format!("Alert still {status} after {}s", max_wait.as_secs()),
        )
    }

    /// Summarize a metric's last `hours` hours at 5-minute resolution.
    pub async fn metric_trend(
        &self,
        metric: &str,
        instance: &str,
        hours: i64,
    ) -> EngineResult<MetricTrend> {
        let query = format!(r#"{metric}{{instance="{instance}"}}"#);
        let end = Utc::now();
        let start = end - chrono::Duration::hours(hours);

        let samples = self.query_range(&query, start, end, "5m").await?;
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();

        if values.len() < 2 {
            return Err(EngineError::Permanent(format!(
                "insufficient data points for {metric}"
            )));
        }

        #[allow(clippy::cast_precision_loss)]
        let trend = (values[values.len() - 1] - values[0]) / values.len() as f64;
        #[allow(clippy::cast_precision_loss)]
        let avg = values.iter().sum::<f64>() / values.len() as f64;

        Ok(MetricTrend {
            metric: metric.to_string(),
            current: values[values.len() - 1],
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            avg,
            trend,
            trend_direction: if trend > 0.0 {
                "increasing"
            } else if trend < 0.0 {
                "decreasing"
            } else {
                "stable"
            },
            data_points: values.len(),
        })
    }

    /// Predict when a decaying metric reaches a threshold.
    ///
    /// Fits the linear trend over a 24 h window; the per-5-minute-sample
    /// trend times 12 gives the hourly rate. The extrapolation is only
    /// meaningful for monotone decay (disk filling, memory leaking); a flat
    /// or improving trend reports stable instead of a prediction.
    pub async fn predict_exhaustion(
        &self,
        metric: &str,
        instance: &str,
        threshold: f64,
    ) -> EngineResult<ExhaustionPrediction> {
        let trend_data = self.metric_trend(metric, instance, 24).await?;

        let current = trend_data.current;
        let trend = trend_data.trend;

        if trend >= 0.0 {
            return Ok(ExhaustionPrediction::StableOrImproving { current, trend });
        }

        let remaining = current - threshold;
        let hours_to_threshold = (remaining / (trend * 12.0)).abs();

        Ok(ExhaustionPrediction::WillExhaust {
            current,
            threshold,
            hours_remaining: (hours_to_threshold * 10.0).round() / 10.0,
            trend_per_hour: trend * 12.0,
        })
    }

    /// Check if Prometheus is reachable.
    pub async fn health_check(&self) -> bool {
        match self.client.get(self.url("/-/healthy")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Prometheus health check failed");
                false
            }
        }
    }
}

async fn check_status(response: reqwest::Response) -> EngineResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        let message = format!("Prometheus returned {status}: {body}");
        if status.is_client_error() {
            Err(EngineError::Permanent(message))
        } else {
            Err(EngineError::Transient(message))
        }
    }
}

fn unwrap_api<T>(body: ApiResponse<T>) -> EngineResult<T> {
    if body.status != "success" {
        return Err(EngineError::Transient(format!(
            "Prometheus query status {}: {}",
            body.status,
            body.error.unwrap_or_default()
        )));
    }
    body.data
        .ok_or_else(|| EngineError::Transient("Prometheus response missing data".to_string()))
}

fn parse_instant(results: &[QueryResult]) -> Vec<MetricSample> {
    results
        .iter()
        .filter_map(|result| {
            let (timestamp, value_str) = result.value.as_ref()?;
            Some(MetricSample {
                labels: result.metric.clone(),
                value: value_str.parse().unwrap_or(0.0),
                timestamp: DateTime::from_timestamp(*timestamp as i64, 0).unwrap_or_else(Utc::now),
            })
        })
        .collect()
}

fn parse_range(results: &[QueryResult]) -> Vec<MetricSample> {
    let mut samples = Vec::new();
    for result in results {
        if let Some(values) = &result.values {
            for (timestamp, value_str) in values {
                samples.push(MetricSample {
                    labels: result.metric.clone(),
                    value: value_str.parse().unwrap_or(0.0),
                    timestamp: DateTime::from_timestamp(*timestamp as i64, 0)
                        .unwrap_or_else(Utc::now),
                });
            }
        }
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alerts_body(alerts: serde_json::Value) -> serde_json::Value {
        serde_json::json!({"status": "success", "data": {"alerts": alerts}})
    }

    #[tokio::test]
    async fn test_alert_status_firing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alerts_body(
                serde_json::json!([{
                    "labels": {"alertname": "ContainerUnhealthy", "instance": "forge:9323"},
                    "state": "firing"
                }]),
            )))
            .mount(&server)
            .await;

        let client = PrometheusClient::with_base_url(&server.uri());
        let status = client
            .alert_status("ContainerUnhealthy", Some("forge:9323"), None)
            .await
            .unwrap();
        assert_eq!(status, "firing");
    }

    #[tokio::test]
    async fn test_alert_status_resolved_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(alerts_body(serde_json::json!([]))),
            )
            .mount(&server)
            .await;

        let client = PrometheusClient::with_base_url(&server.uri());
        let status = client.alert_status("GoneAlert", None, None).await.unwrap();
        assert_eq!(status, "resolved");
    }

    #[tokio::test]
    async fn test_alert_status_label_matching() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alerts_body(
                serde_json::json!([{
                    "labels": {
                        "alertname": "BackupStale",
                        "instance": "forge:9100",
                        "system": "haven"
                    },
                    "state": "firing"
                }]),
            )))
            .mount(&server)
            .await;

        let client = PrometheusClient::with_base_url(&server.uri());

        let mut labels = HashMap::new();
        labels.insert("system".to_string(), "haven".to_string());
        let status = client
            .alert_status("BackupStale", None, Some(&labels))
            .await
            .unwrap();
        assert_eq!(status, "firing");

        labels.insert("system".to_string(), "forge".to_string());
        let status = client
            .alert_status("BackupStale", None, Some(&labels))
            .await
            .unwrap();
        assert_eq!(status, "resolved");
    }

    #[tokio::test]
    async fn test_verify_remediation_times_out_while_firing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(alerts_body(
                serde_json::json!([{
                    "labels": {"alertname": "ServiceDown", "instance": "forge:80"},
                    "state": "firing"
                }]),
            )))
            .mount(&server)
            .await;

        let client = PrometheusClient::with_base_url(&server.uri());
        let (ok, message) = client
            .verify_remediation(
                "ServiceDown",
                Some("forge:80"),
                None,
                Duration::from_millis(300),
                Duration::from_millis(100),
                Duration::from_millis(0),
            )
            .await;

        assert!(!ok);
        assert!(message.contains("still firing"));
    }

    #[tokio::test]
    async fn test_verify_remediation_trusts_exit_codes_when_backend_down() {
        // Nothing listening: every status check errors, so the verifier
        // falls back to trusting the shell instead of failing the attempt.
        let client = PrometheusClient::with_base_url("http://127.0.0.1:1");
        let (ok, message) = client
            .verify_remediation(
                "ServiceDown",
                None,
                None,
                Duration::from_millis(300),
                Duration::from_millis(100),
                Duration::from_millis(0),
            )
            .await;

        assert!(ok);
        assert!(message.contains("trusting exit codes"));
    }

    #[tokio::test]
    async fn test_verify_remediation_resolves() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/alerts"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(alerts_body(serde_json::json!([]))),
            )
            .mount(&server)
            .await;

        let client = PrometheusClient::with_base_url(&server.uri());
        let (ok, message) = client
            .verify_remediation(
                "ServiceDown",
                None,
                None,
                Duration::from_secs(2),
                Duration::from_millis(100),
                Duration::from_millis(0),
            )
            .await;

        assert!(ok);
        assert!(message.contains("resolved"));
    }

    #[tokio::test]
    async fn test_instant_query_parsing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [{
                        "metric": {"instance": "forge:9100"},
                        "value": [1_700_000_000.0, "42.5"]
                    }]
                }
            })))
            .mount(&server)
            .await;

        let client = PrometheusClient::with_base_url(&server.uri());
        let samples = client.query("node_load1").await.unwrap();
        assert_eq!(samples.len(), 1);
        assert!((samples[0].value - 42.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_backend_5xx_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = PrometheusClient::with_base_url(&server.uri());
        let err = client.query("up").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
