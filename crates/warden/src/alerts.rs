//! Alertmanager webhook payload types and alert identity helpers.
//!
//! Reference: <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>
//!
//! The engine reads only a subset of the payload and tolerates extras; labels
//! and annotations are kept as maps so alert rules can attach arbitrary hints
//! (`remediation_host`, `system`, ...) without schema changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Alertmanager webhook payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerPayload {
    /// Version of the payload format
    #[serde(default)]
    pub version: String,
    /// Unique identifier for this group of alerts
    #[serde(default)]
    pub group_key: String,
    /// Status: "firing" or "resolved"
    pub status: String,
    /// Receiver that matched this alert
    #[serde(default)]
    pub receiver: String,
    /// Labels common to all alerts in this group
    #[serde(default)]
    pub group_labels: HashMap<String, String>,
    /// Labels common to all alerts
    #[serde(default)]
    pub common_labels: HashMap<String, String>,
    /// Annotations common to all alerts
    #[serde(default)]
    pub common_annotations: HashMap<String, String>,
    /// External URL for Alertmanager
    #[serde(default)]
    pub external_url: String,
    /// List of alerts in this notification
    pub alerts: Vec<Alert>,
}

/// Individual alert from Alertmanager.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Status: "firing" or "resolved"
    pub status: String,
    /// Alert labels
    pub labels: HashMap<String, String>,
    /// Alert annotations
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// When the alert started firing
    pub starts_at: DateTime<Utc>,
    /// When the alert was resolved (if resolved)
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// URL to the alert in Alertmanager
    #[serde(default)]
    pub generator_url: String,
    /// Unique fingerprint for this alert
    #[serde(default)]
    pub fingerprint: String,
}

impl Alert {
    /// Get the alert name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels
            .get("alertname")
            .map_or("unknown", String::as_str)
    }

    /// Get the severity.
    #[must_use]
    pub fn severity(&self) -> &str {
        self.labels.get("severity").map_or("warning", String::as_str)
    }

    /// Get the raw instance label.
    #[must_use]
    pub fn raw_instance(&self) -> &str {
        self.labels
            .get("instance")
            .map_or("unknown", String::as_str)
    }

    /// Check if this is a firing alert.
    #[must_use]
    pub fn is_firing(&self) -> bool {
        self.status == "firing"
    }

    /// Get the description annotation, falling back to the summary.
    #[must_use]
    pub fn description(&self) -> &str {
        self.annotations
            .get("description")
            .or_else(|| self.annotations.get("summary"))
            .map_or("No description", String::as_str)
    }

    /// Compute the alert instance used as the counting/cooldown identity.
    ///
    /// For `ContainerDown` alerts the `instance` label points at the Docker
    /// exporter, so two different dead containers on the same host would
    /// otherwise share one attempt counter. When both `container` and `host`
    /// labels are present the synthetic `host:container` value wins; an
    /// instance already in `host:container` shape is kept; the raw label is
    /// the last resort.
    #[must_use]
    pub fn identity_instance(&self) -> String {
        if self.name() == "ContainerDown" {
            if let (Some(host), Some(container)) =
                (self.labels.get("host"), self.labels.get("container"))
            {
                return format!("{host}:{container}");
            }
            if self.raw_instance().contains(':') {
                return self.raw_instance().to_string();
            }
        }
        self.raw_instance().to_string()
    }

    /// Validate and normalize the fingerprint.
    ///
    /// Empty or whitespace fingerprints would bypass deduplication entirely,
    /// so they are rejected rather than defaulted.
    pub fn normalized_fingerprint(&self) -> Result<String, crate::error::EngineError> {
        let trimmed = self.fingerprint.trim();
        if trimmed.is_empty() {
            return Err(crate::error::EngineError::Validation(
                "alert fingerprint is empty or missing".to_string(),
            ));
        }
        Ok(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert_with(labels: &[(&str, &str)], fingerprint: &str) -> Alert {
        Alert {
            status: "firing".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            annotations: HashMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            generator_url: String::new(),
            fingerprint: fingerprint.to_string(),
        }
    }

    #[test]
    fn test_container_down_prefers_explicit_labels() {
        // The synthetic identity wins regardless of what `instance` says.
        let alert = alert_with(
            &[
                ("alertname", "ContainerDown"),
                ("instance", "forge:9323"),
                ("container", "caddy"),
                ("host", "forge"),
            ],
            "abc",
        );
        assert_eq!(alert.identity_instance(), "forge:caddy");
    }

    #[test]
    fn test_container_down_keeps_colon_instance() {
        let alert = alert_with(
            &[("alertname", "ContainerDown"), ("instance", "forge:caddy")],
            "abc",
        );
        assert_eq!(alert.identity_instance(), "forge:caddy");
    }

    #[test]
    fn test_non_container_alert_uses_raw_instance() {
        let alert = alert_with(
            &[
                ("alertname", "DiskSpaceLow"),
                ("instance", "forge:9100"),
                ("container", "caddy"),
                ("host", "forge"),
            ],
            "abc",
        );
        assert_eq!(alert.identity_instance(), "forge:9100");
    }

    #[test]
    fn test_fingerprint_validation() {
        let ok = alert_with(&[("alertname", "X"), ("instance", "i")], "  deadbeef  ");
        assert_eq!(ok.normalized_fingerprint().unwrap(), "deadbeef");

        let empty = alert_with(&[("alertname", "X"), ("instance", "i")], "   ");
        assert!(empty.normalized_fingerprint().is_err());
    }

    #[test]
    fn test_payload_tolerates_extras() {
        let json = serde_json::json!({
            "version": "4",
            "groupKey": "{}:{}",
            "status": "firing",
            "receiver": "warden",
            "externalURL": "http://alertmanager:9093",
            "someFutureField": {"nested": true},
            "alerts": [{
                "status": "firing",
                "labels": {"alertname": "ContainerUnhealthy", "instance": "forge:9323"},
                "annotations": {"description": "caddy is unhealthy"},
                "startsAt": "2025-06-01T12:00:00Z",
                "fingerprint": "abc",
                "unknownKey": 7
            }]
        });

        let payload: AlertmanagerPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.alerts.len(), 1);
        assert_eq!(payload.alerts[0].name(), "ContainerUnhealthy");
        assert_eq!(payload.alerts[0].description(), "caddy is unhealthy");
    }
}
