//! Proactive issue detection.
//!
//! A background loop that looks for predictable failures before they fire an
//! alert: disks trending toward full, memory leaking away, TLS certificates
//! about to expire. Findings notify (with a per-issue cooldown so a slow
//! trend does not repeat every cycle) and are recorded for later analysis.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::prometheus::{ExhaustionPrediction, PrometheusClient};
use crate::store::Store;
use notify::{Notifier, NotifyEvent, Severity};

/// Re-notify the same finding at most this often.
const NOTIFICATION_COOLDOWN_HOURS: i64 = 4;

/// Findings fire when a disk is predicted full within this many hours.
const DISK_WARNING_HOURS: f64 = 24.0;

/// Certificate expiry warning threshold in days.
const CERT_WARNING_DAYS: f64 = 14.0;

/// Periodically checks for predictable issues.
pub struct ProactiveMonitor {
    prometheus: PrometheusClient,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    interval: Duration,
    /// Node-exporter instances to watch
    node_instances: Vec<String>,
    notified: Mutex<HashMap<String, DateTime<Utc>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProactiveMonitor {
    #[must_use]
    pub fn new(
        prometheus: PrometheusClient,
        store: Arc<Store>,
        notifier: Arc<Notifier>,
        interval: Duration,
        node_instances: Vec<String>,
    ) -> Self {
        Self {
            prometheus,
            store,
            notifier,
            interval,
            node_instances,
            notified: Mutex::new(HashMap::new()),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Start the background check loop.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(monitor.interval).await;
                monitor.run_checks().await;
            }
        });
        *self.task.lock().expect("proactive task lock") = Some(handle);
        info!(interval_secs = self.interval.as_secs(), "Proactive monitor started");
    }

    /// Stop the background loop.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("proactive task lock").take() {
            handle.abort();
        }
        info!("Proactive monitor stopped");
    }

    /// Run one full check cycle.
    pub async fn run_checks(&self) {
        debug!("Running proactive checks");
        self.check_disk_fill().await;
        self.check_memory_trend().await;
        self.check_certificate_expiry().await;
    }

    async fn check_disk_fill(&self) {
        for instance in &self.node_instances {
            let prediction = self
                .prometheus
                .predict_exhaustion("node_filesystem_avail_bytes", instance, 0.0)
                .await;

            match prediction {
                Ok(ExhaustionPrediction::WillExhaust { hours_remaining, .. })
                    if hours_remaining < DISK_WARNING_HOURS =>
                {
                    let finding = format!(
                        "Root filesystem on {instance} predicted full in {hours_remaining:.1}h"
                    );
                    self.report("disk_fill_rate", instance, &finding, Severity::Warning)
                        .await;
                }
                Ok(_) => {}
                Err(e) => debug!(instance, error = %e, "Disk fill check skipped"),
            }
        }
    }

    async fn check_memory_trend(&self) {
        for instance in &self.node_instances {
            let trend = self
                .prometheus
                .metric_trend("node_memory_MemAvailable_bytes", instance, 6)
                .await;

            match trend {
                Ok(trend) if trend.trend_direction == "decreasing" => {
                    // A shrinking floor is only interesting once available
                    // memory is under ~10% of its observed window maximum.
                    if trend.current < trend.max * 0.10 {
                        let finding = format!(
                            "Available memory on {instance} down to {:.0} MiB and falling",
                            trend.current / 1024.0 / 1024.0
                        );
                        self.report("memory_trend", instance, &finding, Severity::Warning)
                            .await;
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(instance, error = %e, "Memory trend check skipped"),
            }
        }
    }

    async fn check_certificate_expiry(&self) {
        let samples = match self
            .prometheus
            .query("probe_ssl_earliest_cert_expiry - time()")
            .await
        {
            Ok(samples) => samples,
            Err(e) => {
                debug!(error = %e, "Certificate expiry check skipped");
                return;
            }
        };

        for sample in samples {
            let days_remaining = sample.value / 86_400.0;
            if days_remaining < CERT_WARNING_DAYS {
                let target = sample
                    .labels
                    .get("instance")
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                let finding =
                    format!("TLS certificate for {target} expires in {days_remaining:.1} days");
                let severity = if days_remaining < 3.0 {
                    Severity::Critical
                } else {
                    Severity::Warning
                };
                self.report("certificate_expiry", &target, &finding, severity)
                    .await;
            }
        }
    }

    /// Notify and record a finding, subject to the per-issue cooldown.
    async fn report(&self, check: &str, target: &str, finding: &str, severity: Severity) {
        let key = format!("{check}:{target}");

        {
            let mut notified = self.notified.lock().await;
            if let Some(last) = notified.get(&key) {
                if Utc::now() - *last < ChronoDuration::hours(NOTIFICATION_COOLDOWN_HOURS) {
                    debug!(key = %key, "Proactive finding still in notification cooldown");
                    return;
                }
            }
            notified.insert(key.clone(), Utc::now());
        }

        info!(check, target, finding, "Proactive finding");

        if let Err(e) = self
            .store
            .record_proactive_check(check, target, finding, None)
            .await
        {
            warn!(error = %e, "Failed to record proactive finding");
        }

        self.notifier.notify(NotifyEvent::ProactiveFinding {
            check: check.to_string(),
            target: target.to_string(),
            finding: finding.to_string(),
            severity,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn monitor(base_url: &str) -> Arc<ProactiveMonitor> {
        Arc::new(ProactiveMonitor::new(
            PrometheusClient::with_base_url(base_url),
            Arc::new(Store::disconnected()),
            Arc::new(Notifier::disabled()),
            Duration::from_secs(900),
            vec!["forge:9100".to_string()],
        ))
    }

    #[tokio::test]
    async fn test_notification_cooldown() {
        let m = monitor("http://127.0.0.1:1");

        m.report("disk_fill_rate", "forge:9100", "disk filling", Severity::Warning)
            .await;
        m.report("disk_fill_rate", "forge:9100", "disk filling", Severity::Warning)
            .await;

        // Only the first report lands inside the cooldown window.
        let notified = m.notified.lock().await;
        assert_eq!(notified.len(), 1);
    }

    #[tokio::test]
    async fn test_certificate_check_flags_expiring() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [{
                        "metric": {"instance": "https://vault.example"},
                        // Five days of seconds remaining
                        "value": [1_700_000_000.0, "432000"]
                    }]
                }
            })))
            .mount(&server)
            .await;

        let m = monitor(&server.uri());
        m.check_certificate_expiry().await;

        let notified = m.notified.lock().await;
        assert!(notified.contains_key("certificate_expiry:https://vault.example"));
    }
}
