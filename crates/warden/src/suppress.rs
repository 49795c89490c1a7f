//! Alert suppression.
//!
//! Prevents alert storms: alerts for offline hosts are suppressed and rolled
//! into a per-host summary instead of notifying one by one, and children of
//! an active root-cause alert (static cascade table) are dropped until the
//! root cause resolves. The maintenance-window gate lives in the pipeline,
//! ahead of this check.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::hosts::{HostId, HostMonitor};
use notify::{Notifier, NotifyEvent};

/// Known cascading relationships: root-cause alert -> child alerts it drags
/// down with it.
const CASCADING_RULES: &[(&str, &[&str])] = &[
    (
        "WireGuardVPNDown",
        &["OutpostDown", "PostgreSQLDown", "SystemDown", "TargetDown"],
    ),
    (
        "OutpostDown",
        &["ContainerUnhealthy", "ContainerDown", "ServiceUnreachable"],
    ),
    (
        "ForgeDown",
        &[
            "ContainerUnhealthy",
            "ContainerDown",
            "ServiceUnreachable",
            "TargetDown",
        ],
    ),
];

/// Running totals of suppressed alerts for one offline host.
#[derive(Debug, Clone, Default)]
pub struct SuppressionSummary {
    pub suppressed_count: u32,
    pub critical_count: u32,
    pub warning_count: u32,
    pub alert_names: HashSet<String>,
    pub first_suppressed: Option<DateTime<Utc>>,
    pub last_suppressed: Option<DateTime<Utc>>,
}

/// Per-alert suppression decisions.
pub struct AlertSuppressor {
    host_monitor: Arc<HostMonitor>,
    notifier: Arc<Notifier>,
    summaries: RwLock<HashMap<String, SuppressionSummary>>,
    active_root_causes: RwLock<HashSet<String>>,
}

impl AlertSuppressor {
    #[must_use]
    pub fn new(host_monitor: Arc<HostMonitor>, notifier: Arc<Notifier>) -> Self {
        Self {
            host_monitor,
            notifier,
            summaries: RwLock::new(HashMap::new()),
            active_root_causes: RwLock::new(HashSet::new()),
        }
    }

    /// Decide whether to suppress an alert. Returns the reason when it
    /// should be.
    ///
    /// Order matters: an offline host swallows everything aimed at it before
    /// cascade rules get a say, so the summary accounting stays per-host.
    pub async fn should_suppress(
        &self,
        alert_name: &str,
        severity: &str,
        target_host: HostId,
    ) -> Option<String> {
        // Check 1: target host is offline
        if !self.host_monitor.is_available(target_host).await {
            self.record_suppression(target_host, alert_name, severity)
                .await;
            return Some(format!("Host {target_host} is offline"));
        }

        // Check 2: cascading child of an active root cause
        let active = self.active_root_causes.read().await;
        for (root, children) in CASCADING_RULES {
            if children.contains(&alert_name) && active.contains(*root) {
                info!(alert = alert_name, root_cause = root, "Suppressing cascading alert");
                return Some(format!("Cascading from {root}"));
            }
        }

        None
    }

    /// Register an alert as an active root cause, if it is one of the known
    /// cascade roots.
    pub async fn register_root_cause(&self, alert_name: &str) {
        if CASCADING_RULES.iter().any(|(root, _)| *root == alert_name) {
            let inserted = self
                .active_root_causes
                .write()
                .await
                .insert(alert_name.to_string());
            if inserted {
                info!(alert = alert_name, "Root cause registered");
            }
        }
    }

    /// Clear a root cause when its alert resolves.
    pub async fn clear_root_cause(&self, alert_name: &str) {
        if self.active_root_causes.write().await.remove(alert_name) {
            info!(alert = alert_name, "Root cause cleared");
        }
    }

    async fn record_suppression(&self, host: HostId, alert_name: &str, severity: &str) {
        let mut summaries = self.summaries.write().await;
        let summary = summaries.entry(host.as_str().to_string()).or_default();

        if summary.first_suppressed.is_none() {
            summary.first_suppressed = Some(Utc::now());
        }
        summary.suppressed_count += 1;
        summary.alert_names.insert(alert_name.to_string());
        summary.last_suppressed = Some(Utc::now());

        match severity {
            "critical" => summary.critical_count += 1,
            "warning" => summary.warning_count += 1,
            _ => {}
        }
    }

    /// Send one consolidated notification for a host's suppressed alerts
    /// and reset its summary.
    pub async fn send_suppression_summary(&self, host: HostId) {
        let summary = {
            let mut summaries = self.summaries.write().await;
            summaries.remove(host.as_str())
        };

        let Some(summary) = summary else { return };
        if summary.suppressed_count == 0 {
            return;
        }

        let mut alert_names: Vec<String> = summary.alert_names.into_iter().collect();
        alert_names.sort();

        self.notifier.notify(NotifyEvent::SuppressionSummary {
            host: host.as_str().to_string(),
            suppressed_count: summary.suppressed_count,
            critical_count: summary.critical_count,
            warning_count: summary.warning_count,
            alert_names,
            timestamp: Utc::now(),
        });

        info!(host = %host, suppressed = summary.suppressed_count, "Suppression summary sent");
    }

    /// Periodic sweep: hosts with a large suppression backlog that has gone
    /// quiet for ten minutes get a summary notification.
    pub async fn periodic_summary_check(&self) {
        let due: Vec<HostId> = {
            let summaries = self.summaries.read().await;
            summaries
                .iter()
                .filter(|(_, s)| {
                    s.suppressed_count > 10
                        && s.last_suppressed
                            .is_some_and(|t| Utc::now() - t > chrono::Duration::minutes(10))
                })
                .filter_map(|(host, _)| HostId::parse(host))
                .collect()
        };

        for host in due {
            self.send_suppression_summary(host).await;
        }
    }

    /// Current suppression totals by host.
    pub async fn stats(&self) -> HashMap<String, u32> {
        self.summaries
            .read()
            .await
            .iter()
            .map(|(host, s)| (host.clone(), s.suppressed_count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn suppressor() -> (Arc<HostMonitor>, AlertSuppressor) {
        let monitor = Arc::new(HostMonitor::new(
            Arc::new(Store::disconnected()),
            Arc::new(Notifier::disabled()),
            HashMap::new(),
        ));
        let suppressor = AlertSuppressor::new(Arc::clone(&monitor), Arc::new(Notifier::disabled()));
        (monitor, suppressor)
    }

    #[tokio::test]
    async fn test_cascade_suppression() {
        let (_, s) = suppressor();

        // Not suppressed until the root cause is active.
        assert!(s
            .should_suppress("OutpostDown", "critical", HostId::Outpost)
            .await
            .is_none());

        s.register_root_cause("WireGuardVPNDown").await;
        let reason = s
            .should_suppress("OutpostDown", "critical", HostId::Outpost)
            .await;
        assert_eq!(reason.as_deref(), Some("Cascading from WireGuardVPNDown"));

        s.clear_root_cause("WireGuardVPNDown").await;
        assert!(s
            .should_suppress("OutpostDown", "critical", HostId::Outpost)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_non_root_alerts_never_register() {
        let (_, s) = suppressor();
        s.register_root_cause("DiskSpaceLow").await;
        assert!(s
            .should_suppress("ContainerDown", "warning", HostId::Forge)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_offline_host_suppression_and_summary() {
        let (monitor, s) = suppressor();

        for _ in 0..3 {
            monitor
                .record_connection_attempt(HostId::Forge, false, Some("timeout".into()))
                .await;
        }

        let reason = s
            .should_suppress("ContainerDown", "critical", HostId::Forge)
            .await;
        assert_eq!(reason.as_deref(), Some("Host forge is offline"));

        s.should_suppress("ContainerUnhealthy", "warning", HostId::Forge)
            .await;

        let stats = s.stats().await;
        assert_eq!(stats.get("forge"), Some(&2));
    }
}
