//! Self-metrics exported at `/metrics` in Prometheus text format.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};
use tracing::warn;

static ALERTS_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "warden_alerts_received_total",
        "Alerts received from the webhook",
        &["alert_name", "severity"]
    )
    .expect("register alerts_received")
});

static REMEDIATION_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "warden_remediation_outcomes_total",
        "Remediation outcomes by terminal state",
        &["alert_name", "outcome"]
    )
    .expect("register remediation_outcomes")
});

static REMEDIATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "warden_remediation_duration_seconds",
        "Wall-clock duration of remediation attempts",
        &["alert_name"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("register remediation_duration")
});

static ACTIVE_REMEDIATIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "warden_active_remediations",
        "Alerts currently in the pipeline"
    )
    .expect("register active_remediations")
});

static PATTERN_MATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "warden_pattern_matches_total",
        "Learned-pattern lookups that skipped the model",
        &["hit"]
    )
    .expect("register pattern_matches")
});

static DATABASE_UP: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("warden_database_up", "Database connectivity (1 = up)")
        .expect("register database_up")
});

static SELF_RESTARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "warden_self_restarts_total",
        "Self-preservation handoffs by target and result",
        &["target", "result"]
    )
    .expect("register self_restarts")
});

/// Record an alert arriving at the webhook.
pub fn record_alert_received(alert_name: &str, severity: &str) {
    ALERTS_RECEIVED
        .with_label_values(&[alert_name, severity])
        .inc();
}

/// Record the terminal outcome of one pipeline run.
pub fn record_outcome(alert_name: &str, outcome: &str) {
    REMEDIATION_OUTCOMES
        .with_label_values(&[alert_name, outcome])
        .inc();
}

/// Record the duration of an executed remediation.
pub fn record_duration(alert_name: &str, seconds: f64) {
    REMEDIATION_DURATION
        .with_label_values(&[alert_name])
        .observe(seconds);
}

/// Track the number of in-flight pipeline runs.
pub fn active_remediations_add(delta: i64) {
    ACTIVE_REMEDIATIONS.add(delta);
}

/// Record whether a pattern lookup produced a direct hit.
pub fn record_pattern_match(hit: bool) {
    PATTERN_MATCHES
        .with_label_values(&[if hit { "true" } else { "false" }])
        .inc();
}

/// Publish database connectivity.
pub fn set_database_up(up: bool) {
    DATABASE_UP.set(if up { 1.0 } else { 0.0 });
}

/// Record a self-restart handoff result.
pub fn record_self_restart(target: &str, result: &str) {
    SELF_RESTARTS.with_label_values(&[target, result]).inc();
}

/// Render the registry in Prometheus text exposition format.
#[must_use]
pub fn render() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Metrics encoding failed");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_metrics() {
        record_alert_received("ContainerDown", "critical");
        record_outcome("ContainerDown", "remediated");
        record_duration("ContainerDown", 12.0);
        record_pattern_match(true);
        set_database_up(true);

        let text = render();
        assert!(text.contains("warden_alerts_received_total"));
        assert!(text.contains("warden_remediation_outcomes_total"));
        assert!(text.contains("warden_database_up 1"));
    }
}
