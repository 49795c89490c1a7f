//! Hint extraction and target routing.
//!
//! Alert rules can carry remediation hints in labels and annotations
//! (`remediation_host`, `remediation_hint`, `system`, `runbook_url`, ...).
//! Hint strings come from operator-edited YAML, so every value is NFKC
//! normalized and stripped of control characters before use.

use std::collections::HashMap;
use tracing::{info, warn};
use unicode_normalization::UnicodeNormalization;

use crate::alerts::Alert;
use crate::hosts::HostId;
use crate::ssh::ServiceKind;

/// Hints extracted from one alert.
#[derive(Debug, Clone, Default)]
pub struct Hints {
    pub remediation_hint: Option<String>,
    /// Explicit target-host override (`remediation_host` label, or derived
    /// from the `system` label for multi-system alerts)
    pub target_host: Option<String>,
    pub service: Option<String>,
    pub container: Option<String>,
    pub job: Option<String>,
    pub runbook_url: Option<String>,
    pub suggested_remediation: Option<String>,
    /// The `system` label on multi-system alerts (which backup is stale, ...)
    pub system: Option<String>,
    /// Per-system command contributed by the system-label remediation map
    pub system_specific_command: Option<String>,
}

/// Normalize a hint value: NFKC, control characters stripped (newline and
/// tab survive), trimmed. Empty results are discarded by the extractor.
#[must_use]
pub fn sanitize_hint_value(value: &str) -> String {
    value
        .nfkc()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>()
        .trim()
        .to_string()
}

fn sanitized(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key)
        .map(|v| sanitize_hint_value(v))
        .filter(|v| !v.is_empty())
}

/// Per-system backup remediation map for `BackupStale` alerts. The `system`
/// label names which backup is stale; it overrides the target host and
/// contributes the backup script to re-run.
const BACKUP_REMEDIATION_MAP: &[(&str, &str, &str)] = &[
    ("haven", "keep", "/opt/homelab/backup/backup_haven_notify.sh"),
    ("keep", "keep", "/opt/homelab/backup/backup_keep_notify.sh"),
    ("forge", "forge", "/opt/docker/backups/backup_notify.sh"),
    ("outpost", "outpost", "/opt/backups/backup_vps_notify.sh"),
];

/// Extract hints from alert labels and annotations.
#[must_use]
pub fn extract_hints(alert: &Alert) -> Hints {
    let mut hints = Hints {
        remediation_hint: sanitized(&alert.labels, "remediation_hint"),
        target_host: sanitized(&alert.labels, "remediation_host"),
        service: sanitized(&alert.labels, "service"),
        container: sanitized(&alert.labels, "container"),
        job: sanitized(&alert.labels, "job"),
        runbook_url: sanitized(&alert.annotations, "runbook_url"),
        suggested_remediation: sanitized(&alert.annotations, "remediation"),
        system: sanitized(&alert.labels, "system"),
        system_specific_command: None,
    };

    // Multi-system alerts: the system label is more specific than anything
    // the static alert rule could carry.
    if alert.name().eq_ignore_ascii_case("BackupStale") {
        if let Some(system) = hints.system.clone() {
            let system_lower = system.to_lowercase();
            if let Some((_, target, command)) = BACKUP_REMEDIATION_MAP
                .iter()
                .find(|(name, _, _)| *name == system_lower)
            {
                hints.target_host = Some((*target).to_string());
                hints.system_specific_command = Some((*command).to_string());
                info!(
                    system = %system,
                    target_host = target,
                    command,
                    "System-specific remediation hint applied"
                );
            }
        }
    }

    hints
}

/// Determine which host an alert targets.
///
/// Precedence: explicit hint override, then hostname substrings in the
/// instance label, then alert-name heuristics, then the forge default
/// (most services run there).
#[must_use]
pub fn determine_target_host(alert: &Alert, hints: &Hints) -> HostId {
    if let Some(hint_host) = &hints.target_host {
        if let Some(host) = HostId::parse(hint_host) {
            return host;
        }
        warn!(hint = %hint_host, "Unrecognized remediation_host hint, falling back");
    }

    let instance = alert.raw_instance().to_lowercase();
    if instance.contains("outpost") || instance.contains("vps") {
        return HostId::Outpost;
    }
    if instance.contains("haven") || instance.contains("homeassistant") {
        return HostId::Haven;
    }
    if instance.contains("keep") {
        return HostId::Keep;
    }
    if instance.contains("forge") {
        return HostId::Forge;
    }

    let alert_name = alert.name().to_lowercase();
    if alert_name.contains("wireguard") || alert_name.contains("vpn") {
        return HostId::Outpost;
    }
    if alert_name.contains("frigate")
        || alert_name.contains("adguard")
        || alert_name.contains("caddy")
    {
        return HostId::Forge;
    }
    if alert_name.contains("zigbee") || alert_name.contains("automation") {
        return HostId::Haven;
    }

    warn!(
        instance = %alert.raw_instance(),
        alert_name = %alert.name(),
        "Host determination defaulted to forge"
    );
    HostId::Forge
}

/// Extract the service/container name from alert labels.
#[must_use]
pub fn extract_service_name(alert: &Alert) -> Option<String> {
    for key in ["container_name", "container", "service_name", "systemd_unit"] {
        if let Some(value) = alert.labels.get(key) {
            return Some(value.clone());
        }
    }

    // Instance label in "service:port" form
    let instance = alert.raw_instance();
    if let Some((name, _)) = instance.split_once(':') {
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    // Last resort: "container X is ..." in the description
    if alert.name().to_lowercase().contains("container") {
        static CONTAINER_RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
            regex::Regex::new(r"container\s+([a-z0-9_-]+)\s+is").expect("container pattern")
        });
        let description = alert.description().to_lowercase();
        if let Some(captures) = CONTAINER_RE.captures(&description) {
            return Some(captures[1].to_string());
        }
    }

    None
}

/// Docker containers known to run in the fleet.
const DOCKER_SERVICES: &[&str] = &[
    "caddy",
    "frigate",
    "adguard",
    "vaultwarden",
    "prometheus",
    "grafana",
    "loki",
    "alertmanager",
    "n8n",
    "n8n-db",
    "actual-budget",
    "blackbox-exporter",
];

/// Services managed by systemd.
const SYSTEMD_SERVICES: &[&str] = &[
    "wg-quick",
    "wireguard",
    "ssh",
    "docker",
    "postgresql",
    "zigbee2mqtt",
];

/// Determine whether a service is a Docker container, a systemd unit, or a
/// bare-system concern. Defaults to docker: most of the fleet is
/// containerized.
#[must_use]
pub fn determine_service_kind(alert: &Alert, service_name: Option<&str>) -> ServiceKind {
    let alert_name = alert.name().to_lowercase();

    if alert_name.contains("container") || alert_name.contains("docker") {
        return ServiceKind::Docker;
    }
    if alert_name.contains("systemd") || alert_name.contains("service") {
        return ServiceKind::Systemd;
    }
    if alert_name.contains("system") || alert_name.contains("node") {
        return ServiceKind::System;
    }

    if let Some(name) = service_name {
        let lower = name.to_lowercase();
        if DOCKER_SERVICES.contains(&lower.as_str()) {
            return ServiceKind::Docker;
        }
        if SYSTEMD_SERVICES.iter().any(|svc| lower.contains(svc)) {
            return ServiceKind::Systemd;
        }
    }

    ServiceKind::Docker
}

/// Keywords that mark an alert as spanning multiple hosts.
const CROSS_SYSTEM_KEYWORDS: &[&str] = &[
    "wireguard",
    "vpn",
    "tunnel",
    "site-to-site",
    "connectivity",
    "unreachable",
    "network",
];

/// Whether an alert involves multiple systems (VPN, connectivity).
#[must_use]
pub fn is_cross_system_alert(alert: &Alert) -> bool {
    let alert_name = alert.name().to_lowercase();
    let description = alert.description().to_lowercase();

    CROSS_SYSTEM_KEYWORDS
        .iter()
        .any(|kw| alert_name.contains(kw) || description.contains(kw))
}

/// Hosts potentially involved in an alert. Cross-system alerts return every
/// plausible endpoint so the LLM investigates both sides.
#[must_use]
pub fn related_hosts(alert: &Alert, hints: &Hints) -> Vec<HostId> {
    if !is_cross_system_alert(alert) {
        return vec![determine_target_host(alert, hints)];
    }

    let alert_name = alert.name().to_lowercase();
    if alert_name.contains("wireguard") || alert_name.contains("vpn") {
        // Both tunnel endpoints
        return vec![HostId::Forge, HostId::Outpost];
    }
    if alert_name.contains("network") || alert_name.contains("connectivity") {
        return vec![HostId::Forge, HostId::Haven, HostId::Outpost];
    }

    vec![determine_target_host(alert, hints)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn alert(
        name: &str,
        instance: &str,
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
    ) -> Alert {
        let mut label_map: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        label_map.insert("alertname".to_string(), name.to_string());
        label_map.insert("instance".to_string(), instance.to_string());

        Alert {
            status: "firing".to_string(),
            labels: label_map,
            annotations: annotations
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            starts_at: Utc::now(),
            ends_at: None,
            generator_url: String::new(),
            fingerprint: "fp".to_string(),
        }
    }

    #[test]
    fn test_sanitize_strips_control_chars() {
        assert_eq!(sanitize_hint_value("  forge\u{0000}\u{0007} "), "forge");
        assert_eq!(sanitize_hint_value("a\nb\tc"), "a\nb\tc");
        // NFKC folds compatibility forms
        assert_eq!(sanitize_hint_value("ﬀorge"), "fforge");
    }

    #[test]
    fn test_hint_host_override_wins() {
        let a = alert(
            "DiskSpaceLow",
            "forge:9100",
            &[("remediation_host", "outpost")],
            &[],
        );
        let hints = extract_hints(&a);
        assert_eq!(determine_target_host(&a, &hints), HostId::Outpost);
    }

    #[test]
    fn test_instance_substring_routing() {
        let a = alert("SomethingDown", "outpost:9100", &[], &[]);
        assert_eq!(
            determine_target_host(&a, &Hints::default()),
            HostId::Outpost
        );

        let a = alert("SomethingDown", "haven:8123", &[], &[]);
        assert_eq!(determine_target_host(&a, &Hints::default()), HostId::Haven);
    }

    #[test]
    fn test_alert_name_heuristics_and_default() {
        let a = alert("WireGuardVPNDown", "10.0.0.5:51820", &[], &[]);
        assert_eq!(
            determine_target_host(&a, &Hints::default()),
            HostId::Outpost
        );

        let a = alert("ZigbeeCoordinatorDown", "10.0.0.7:1883", &[], &[]);
        assert_eq!(determine_target_host(&a, &Hints::default()), HostId::Haven);

        let a = alert("UnknownAlert", "10.0.0.9:1234", &[], &[]);
        assert_eq!(determine_target_host(&a, &Hints::default()), HostId::Forge);
    }

    #[test]
    fn test_backup_stale_system_map() {
        let a = alert("BackupStale", "forge:9100", &[("system", "haven")], &[]);
        let hints = extract_hints(&a);
        assert_eq!(hints.target_host.as_deref(), Some("keep"));
        assert!(hints
            .system_specific_command
            .as_deref()
            .unwrap()
            .contains("backup_haven"));
        assert_eq!(determine_target_host(&a, &hints), HostId::Keep);
    }

    #[test]
    fn test_service_name_extraction() {
        let a = alert("ContainerDown", "forge:9323", &[("container", "caddy")], &[]);
        assert_eq!(extract_service_name(&a).as_deref(), Some("caddy"));

        let a = alert("GrafanaDown", "grafana:3000", &[], &[]);
        assert_eq!(extract_service_name(&a).as_deref(), Some("grafana"));

        let a = alert(
            "ContainerUnhealthy",
            "forge",
            &[],
            &[("description", "Container frigate is unhealthy")],
        );
        assert_eq!(extract_service_name(&a).as_deref(), Some("frigate"));
    }

    #[test]
    fn test_service_kind_determination() {
        let a = alert("ContainerDown", "forge:9323", &[], &[]);
        assert_eq!(determine_service_kind(&a, None), ServiceKind::Docker);

        let a = alert("SystemdUnitFailed", "forge:9100", &[], &[]);
        assert_eq!(determine_service_kind(&a, Some("nginx")), ServiceKind::Systemd);

        let a = alert("SomethingDown", "x:1", &[], &[]);
        assert_eq!(
            determine_service_kind(&a, Some("wg-quick@wg0")),
            ServiceKind::Systemd
        );
        assert_eq!(determine_service_kind(&a, Some("caddy")), ServiceKind::Docker);
    }

    #[test]
    fn test_cross_system_detection() {
        let a = alert("WireGuardVPNDown", "x:1", &[], &[]);
        assert!(is_cross_system_alert(&a));
        let hosts = related_hosts(&a, &Hints::default());
        assert_eq!(hosts, vec![HostId::Forge, HostId::Outpost]);

        let a = alert("DiskSpaceLow", "forge:9100", &[], &[]);
        assert!(!is_cross_system_alert(&a));
        assert_eq!(related_hosts(&a, &Hints::default()).len(), 1);
    }
}
