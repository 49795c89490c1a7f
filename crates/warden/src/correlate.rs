//! Alert correlation for root cause analysis.
//!
//! Given the current alert and the recent-alerts window (from the attempt
//! log), three rules are tried in order; the first match wins:
//!
//! 1. **Cascade**: static `(A, B) -> root` pairs.
//! 2. **Dependency**: a static `service -> [deps]` map; the service name is
//!    derived from the alert name by suffix stripping.
//! 3. **Host**: multiple alerts on the same host where one is a resource
//!    alert; the resource alert is the root cause.
//!
//! The dependency rule is intentionally loose: any recent alert whose
//! suffix-stripped service name contains a dependency name counts as
//! evidence. It over-correlates in exchange for never missing an obvious
//! upstream outage. The correlator is advisory; the pipeline decides.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::Alert;
use crate::store::Store;

/// Time window for temporal correlation, in seconds.
const CORRELATION_WINDOW_SECS: i64 = 120;

/// Service dependency map: service -> services it depends on.
const DEPENDENCIES: &[(&str, &[&str])] = &[
    // Core infrastructure
    ("grafana", &["prometheus", "loki", "docker"]),
    ("prometheus", &["docker"]),
    ("loki", &["docker"]),
    ("alertmanager", &["prometheus", "docker"]),
    // Media/Security
    ("frigate", &["docker", "coral-tpu", "mosquitto"]),
    ("scrypted", &["docker"]),
    // Automation
    ("n8n", &["n8n-db", "docker"]),
    ("home-assistant", &["mosquitto", "zigbee2mqtt"]),
    ("zigbee2mqtt", &["mosquitto"]),
    // Network
    ("caddy", &["docker"]),
    ("adguard", &["docker", "unbound"]),
    ("unbound", &["docker"]),
    // Database-backed apps
    ("vaultwarden", &["docker"]),
    ("actual-budget", &["docker"]),
];

/// Cascading alert pairs: when both fire together, the named root wins.
const CASCADE_PATTERNS: &[(&str, &str, &str)] = &[
    // VPN issues cascade to remote services
    ("WireGuardVPNDown", "OutpostDown", "WireGuardVPNDown"),
    ("WireGuardVPNDown", "OutpostServiceDown", "WireGuardVPNDown"),
    ("WireGuardVPNDown", "N8NDown", "WireGuardVPNDown"),
    ("WireGuardVPNDown", "ActualBudgetDown", "WireGuardVPNDown"),
    // Docker daemon issues cascade to all containers
    ("DockerDaemonUnresponsive", "ContainerDown", "DockerDaemonUnresponsive"),
    ("DockerDaemonUnresponsive", "ContainerUnhealthy", "DockerDaemonUnresponsive"),
    // Resource exhaustion cascades
    ("HighMemoryUsage", "ContainerOOMKilled", "HighMemoryUsage"),
    ("DiskSpaceCritical", "ContainerDown", "DiskSpaceCritical"),
    ("DiskSpaceLow", "ContainerUnhealthy", "DiskSpaceLow"),
    // Database dependencies
    ("PostgreSQLDown", "N8NDown", "PostgreSQLDown"),
    ("PostgreSQLDown", "GrafanaDown", "PostgreSQLDown"),
    // MQTT cascade
    ("MQTTBrokerDown", "Zigbee2MQTTDown", "MQTTBrokerDown"),
    ("MQTTBrokerDown", "HomeAssistantMQTTUnavailable", "MQTTBrokerDown"),
    // DNS cascade
    ("AdGuardDown", "DNSResolutionFailed", "AdGuardDown"),
    ("UnboundDown", "DNSResolutionSlow", "UnboundDown"),
    // Home automation addons
    ("HomeAssistantDown", "Zigbee2MQTTDown", "HomeAssistantDown"),
];

/// Resource alerts that take root-cause priority in host correlation.
const RESOURCE_ALERTS: &[&str] = &[
    "HighMemoryUsage",
    "DiskSpaceLow",
    "DiskSpaceCritical",
    "HighCPUUsage",
    "DockerDaemonUnresponsive",
];

/// Alert-name suffixes stripped to recover the service name.
const SERVICE_SUFFIXES: &[&str] = &[
    "Down",
    "Unhealthy",
    "Error",
    "Unreachable",
    "Failed",
    "Unavailable",
    "OOMKilled",
    "CrashLooping",
];

/// A correlated group of alerts.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: String,
    pub root_cause_alert: String,
    pub related_alerts: Vec<String>,
    /// "cascade", "dependency", or "host"
    pub correlation_type: &'static str,
    pub created_at: DateTime<Utc>,
    pub root_cause_instance: Option<String>,
}

/// A recent alert identity from the attempt log.
#[derive(Debug, Clone)]
struct RecentAlert {
    alert_name: String,
    alert_instance: String,
}

/// Correlates alerts to find the root cause of an incident.
pub struct AlertCorrelator {
    store: Arc<Store>,
}

impl AlertCorrelator {
    #[must_use]
    pub const fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Check whether the alert correlates with recent alerts.
    ///
    /// Returns the incident when it does, `None` for a standalone alert.
    pub async fn correlate_alert(&self, alert: &Alert) -> Option<Incident> {
        let alert_name = alert.name();
        let alert_host = extract_host_from_instance(alert.raw_instance());

        debug!(alert_name, instance = %alert.raw_instance(), "Correlating alert");

        let recent = self.recent_alerts().await;

        if let Some(incident) = check_cascade_patterns(alert_name, &recent) {
            info!(
                alert = alert_name,
                root_cause = %incident.root_cause_alert,
                "Cascade correlation found"
            );
            return Some(incident);
        }

        if let Some(incident) = check_dependency_correlation(alert_name, &recent) {
            info!(
                alert = alert_name,
                root_cause = %incident.root_cause_alert,
                "Dependency correlation found"
            );
            return Some(incident);
        }

        if let Some(host) = alert_host {
            if let Some(incident) = check_host_correlation(alert_name, &host, &recent) {
                info!(
                    alert = alert_name,
                    root_cause = %incident.root_cause_alert,
                    "Host correlation found"
                );
                return Some(incident);
            }
        }

        debug!(alert = alert_name, "No correlation found");
        None
    }

    /// Whether the alert should be skipped because the incident's root cause
    /// is being handled instead.
    #[must_use]
    pub fn should_skip_alert(alert_name: &str, incident: Option<&Incident>) -> bool {
        incident.is_some_and(|i| i.root_cause_alert != alert_name)
    }

    /// Render the incident into context text for the LLM.
    pub async fn correlation_context(&self, alert: &Alert) -> String {
        let Some(incident) = self.correlate_alert(alert).await else {
            return String::new();
        };

        let mut lines = vec![
            "\n## Alert Correlation Context".to_string(),
            "This alert appears to be part of a larger incident.".to_string(),
            format!("Correlation type: {}", incident.correlation_type),
            format!("Likely root cause: {}", incident.root_cause_alert),
        ];

        if let Some(instance) = &incident.root_cause_instance {
            lines.push(format!("Root cause instance: {instance}"));
        }
        if incident.related_alerts.len() > 1 {
            lines.push(format!(
                "Related alerts: {}",
                incident.related_alerts.join(", ")
            ));
        }

        lines.push(String::new());
        lines.push("**Recommendation:** Focus on the root cause alert first.".to_string());
        lines.push(match incident.correlation_type {
            "cascade" => {
                "This is a cascade failure - fixing the root cause should resolve dependent alerts."
                    .to_string()
            }
            "dependency" => {
                "This alert depends on another service that is also alerting.".to_string()
            }
            _ => "Multiple alerts on the same host - may indicate resource exhaustion.".to_string(),
        });

        lines.join("\n")
    }

    async fn recent_alerts(&self) -> Vec<RecentAlert> {
        match self
            .store
            .get_recent_alert_identities(CORRELATION_WINDOW_SECS)
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .map(|(alert_name, alert_instance, _)| RecentAlert {
                    alert_name,
                    alert_instance,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to load recent alerts for correlation");
                vec![]
            }
        }
    }
}

fn new_incident(
    root: &str,
    related: Vec<String>,
    correlation_type: &'static str,
    root_instance: Option<String>,
) -> Incident {
    Incident {
        id: format!("incident-{}", Uuid::new_v4()),
        root_cause_alert: root.to_string(),
        related_alerts: related,
        correlation_type,
        created_at: Utc::now(),
        root_cause_instance: root_instance,
    }
}

fn check_cascade_patterns(alert_name: &str, recent: &[RecentAlert]) -> Option<Incident> {
    for (alert_a, alert_b, root) in CASCADE_PATTERNS {
        if alert_name == *alert_a && recent.iter().any(|r| r.alert_name == *alert_b) {
            return Some(new_incident(
                root,
                vec![(*alert_a).to_string(), (*alert_b).to_string()],
                "cascade",
                None,
            ));
        }
        if alert_name == *alert_b {
            if let Some(root_alert) = recent.iter().find(|r| r.alert_name == *alert_a) {
                return Some(new_incident(
                    root,
                    vec![(*alert_a).to_string(), (*alert_b).to_string()],
                    "cascade",
                    Some(root_alert.alert_instance.clone()),
                ));
            }
        }
    }
    None
}

fn check_dependency_correlation(alert_name: &str, recent: &[RecentAlert]) -> Option<Incident> {
    let service = extract_service_name(alert_name)?;
    let deps = DEPENDENCIES
        .iter()
        .find(|(name, _)| *name == service)
        .map(|(_, deps)| *deps)?;

    for dep in deps {
        for recent_alert in recent {
            let Some(recent_service) = extract_service_name(&recent_alert.alert_name) else {
                continue;
            };
            if recent_service.contains(dep) {
                return Some(new_incident(
                    &recent_alert.alert_name,
                    vec![alert_name.to_string()],
                    "dependency",
                    Some(recent_alert.alert_instance.clone()),
                ));
            }
        }
    }
    None
}

fn check_host_correlation(
    alert_name: &str,
    alert_host: &str,
    recent: &[RecentAlert],
) -> Option<Incident> {
    let same_host: Vec<&RecentAlert> = recent
        .iter()
        .filter(|r| {
            r.alert_name != alert_name
                && extract_host_from_instance(&r.alert_instance).as_deref() == Some(alert_host)
        })
        .collect();

    if same_host.is_empty() {
        return None;
    }

    // Resource alerts take priority as the root cause.
    for resource_alert in RESOURCE_ALERTS {
        for recent_alert in &same_host {
            if recent_alert.alert_name.contains(resource_alert) {
                let mut related = vec![alert_name.to_string()];
                related.extend(same_host.iter().map(|r| r.alert_name.clone()));
                return Some(new_incident(
                    &recent_alert.alert_name,
                    related,
                    "host",
                    Some(recent_alert.alert_instance.clone()),
                ));
            }
        }
    }

    None
}

/// Derive the service name from an alert name by stripping a known suffix:
/// `GrafanaDown` -> `grafana`.
fn extract_service_name(alert_name: &str) -> Option<String> {
    for suffix in SERVICE_SUFFIXES {
        if alert_name.to_lowercase().ends_with(&suffix.to_lowercase()) {
            let service = &alert_name[..alert_name.len() - suffix.len()];
            if !service.is_empty() {
                return Some(service.to_lowercase());
            }
        }
    }
    None
}

/// The host part of an instance label (`host:port` or bare hostname).
fn extract_host_from_instance(instance: &str) -> Option<String> {
    if instance.is_empty() {
        return None;
    }
    Some(
        instance
            .split_once(':')
            .map_or(instance, |(host, _)| host)
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recent(entries: &[(&str, &str)]) -> Vec<RecentAlert> {
        entries
            .iter()
            .map(|(name, instance)| RecentAlert {
                alert_name: (*name).to_string(),
                alert_instance: (*instance).to_string(),
            })
            .collect()
    }

    #[test]
    fn test_extract_service_name() {
        assert_eq!(extract_service_name("GrafanaDown").as_deref(), Some("grafana"));
        assert_eq!(
            extract_service_name("ZigbeeCrashLooping").as_deref(),
            Some("zigbee")
        );
        assert_eq!(extract_service_name("HighMemoryUsage"), None);
        assert_eq!(extract_service_name("Down"), None);
    }

    #[test]
    fn test_extract_host_from_instance() {
        assert_eq!(
            extract_host_from_instance("forge:9100").as_deref(),
            Some("forge")
        );
        assert_eq!(extract_host_from_instance("forge").as_deref(), Some("forge"));
        assert_eq!(extract_host_from_instance(""), None);
    }

    #[test]
    fn test_cascade_child_with_root_recent() {
        let recent = recent(&[("WireGuardVPNDown", "outpost:51820")]);
        let incident = check_cascade_patterns("OutpostDown", &recent).unwrap();
        assert_eq!(incident.root_cause_alert, "WireGuardVPNDown");
        assert_eq!(incident.correlation_type, "cascade");
        assert_eq!(incident.root_cause_instance.as_deref(), Some("outpost:51820"));
    }

    #[test]
    fn test_cascade_root_with_child_recent() {
        let recent = recent(&[("ContainerDown", "forge:caddy")]);
        let incident = check_cascade_patterns("DockerDaemonUnresponsive", &recent).unwrap();
        assert_eq!(incident.root_cause_alert, "DockerDaemonUnresponsive");
    }

    #[test]
    fn test_dependency_correlation() {
        let recent = recent(&[("PrometheusDown", "forge:9090")]);
        let incident = check_dependency_correlation("GrafanaDown", &recent).unwrap();
        assert_eq!(incident.root_cause_alert, "PrometheusDown");
        assert_eq!(incident.correlation_type, "dependency");
    }

    #[test]
    fn test_dependency_requires_known_service() {
        let recent = recent(&[("PrometheusDown", "forge:9090")]);
        assert!(check_dependency_correlation("MysteryAlert", &recent).is_none());
    }

    #[test]
    fn test_host_correlation_picks_resource_alert() {
        let recent = recent(&[
            ("DiskSpaceCritical", "forge:9100"),
            ("ContainerUnhealthy", "forge:9323"),
        ]);
        let incident = check_host_correlation("ContainerDown", "forge", &recent).unwrap();
        assert_eq!(incident.root_cause_alert, "DiskSpaceCritical");
        assert_eq!(incident.correlation_type, "host");
    }

    #[test]
    fn test_host_correlation_without_resource_alert() {
        let recent = recent(&[("ContainerUnhealthy", "forge:9323")]);
        assert!(check_host_correlation("ContainerDown", "forge", &recent).is_none());
    }

    #[test]
    fn test_should_skip_non_root() {
        let incident = new_incident(
            "WireGuardVPNDown",
            vec!["OutpostDown".to_string()],
            "cascade",
            None,
        );
        assert!(AlertCorrelator::should_skip_alert(
            "OutpostDown",
            Some(&incident)
        ));
        assert!(!AlertCorrelator::should_skip_alert(
            "WireGuardVPNDown",
            Some(&incident)
        ));
        assert!(!AlertCorrelator::should_skip_alert("OutpostDown", None));
    }
}
