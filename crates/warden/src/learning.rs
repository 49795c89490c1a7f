//! Pattern learning from remediation outcomes.
//!
//! After a *verified* successful remediation the alert's structural identity
//! (symptom fingerprint) and the commands that fixed it become a pattern.
//! On later alerts the engine looks up matching patterns and, depending on
//! effective confidence (`pattern confidence x similarity`), either applies
//! one directly (skipping the LLM call entirely), hands it to the LLM as
//! context, or ignores it. Verified failures feed a separate failure-pattern
//! table so known-bad command sets are not retried.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::store::{Pattern, RemediationAttempt, Store};

/// Effective confidence at or above this applies the pattern directly.
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.75;
/// Effective confidence at or above this passes the pattern to the LLM as
/// context.
pub const MEDIUM_CONFIDENCE_THRESHOLD: f64 = 0.50;
/// Successes required before a pattern is trusted at all.
const MIN_SUCCESS_COUNT: i32 = 2;
/// Similarity floor for a pattern to count as a match.
const SIMILARITY_THRESHOLD: f64 = 0.7;
/// Pattern cache lifetime.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Labels that dominate pattern matching, in order. `system` is critical for
/// multi-system alerts like `BackupStale`.
const PRIORITY_LABELS: &[&str] = &["system", "remediation_host", "category"];

/// Standard labels that describe the symptom shape.
const STANDARD_LABELS: &[&str] = &[
    "alertname",
    "job",
    "severity",
    "container",
    "service",
    "host",
    "device",
    "filesystem",
];

/// Fingerprint parts with these prefixes must match exactly between pattern
/// and alert.
const CRITICAL_PREFIXES: &[&str] = &["system:", "container:", "remediation_host:"];

/// A matched pattern with its scores.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern: Pattern,
    pub similarity: f64,
    pub effective_confidence: f64,
}

/// What the pipeline should do with the best pattern match.
#[derive(Debug, Clone)]
pub enum PatternDecision {
    /// Apply the pattern's commands directly; skip the LLM.
    UseDirectly(PatternMatch),
    /// Give the pattern to the LLM as historical context; it may override.
    AsContext(PatternMatch),
    /// No usable pattern.
    NoMatch,
}

/// Manages learned remediation patterns and failure patterns.
pub struct LearningEngine {
    store: Arc<Store>,
    cache: RwLock<Option<(Instant, Vec<Pattern>)>>,
}

impl LearningEngine {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    /// Decide whether a learned pattern should handle this alert.
    pub async fn pattern_decision(
        &self,
        alert_name: &str,
        alert_labels: &HashMap<String, String>,
    ) -> PatternDecision {
        let patterns = self.cached_patterns().await;
        let mut matches = match_patterns(
            alert_name,
            alert_labels,
            &patterns,
            MEDIUM_CONFIDENCE_THRESHOLD,
        );

        let Some(best) = matches.drain(..).next() else {
            return PatternDecision::NoMatch;
        };

        if best.effective_confidence >= HIGH_CONFIDENCE_THRESHOLD {
            info!(
                pattern_id = best.pattern.id,
                confidence = best.effective_confidence,
                alert_name,
                "Using learned pattern directly"
            );
            PatternDecision::UseDirectly(best)
        } else if best.effective_confidence >= MEDIUM_CONFIDENCE_THRESHOLD {
            info!(
                pattern_id = best.pattern.id,
                confidence = best.effective_confidence,
                alert_name,
                "Passing pattern to model as context"
            );
            PatternDecision::AsContext(best)
        } else {
            PatternDecision::NoMatch
        }
    }

    /// Extract (or reinforce) a pattern from a verified successful attempt.
    ///
    /// Returns the pattern id, or `None` when the attempt does not qualify.
    pub async fn extract_pattern(
        &self,
        attempt: &RemediationAttempt,
        alert_labels: &HashMap<String, String>,
    ) -> EngineResult<Option<i64>> {
        if !attempt.success {
            warn!("Skipping pattern extraction: attempt not successful");
            return Ok(None);
        }

        let fingerprint = build_symptom_fingerprint(&attempt.alert_name, alert_labels);
        let category = categorize_alert(&attempt.alert_name);
        let root_cause = attempt.ai_analysis.as_deref().and_then(extract_root_cause);
        let target_host = alert_labels
            .get("system")
            .or_else(|| alert_labels.get("remediation_host"))
            .cloned();

        info!(
            alert_name = %attempt.alert_name,
            category,
            symptom = &fingerprint[..fingerprint.len().min(100)],
            "Extracting pattern"
        );

        let existing = self
            .store
            .find_pattern_by_fingerprint(&attempt.alert_name, &fingerprint)
            .await?;

        let pattern_id = if let Some(pattern) = existing {
            self.store
                .record_pattern_outcome(
                    pattern.id,
                    true,
                    attempt.execution_duration_seconds.unwrap_or(0),
                    Some(&attempt.commands_executed),
                )
                .await?;
            info!(pattern_id = pattern.id, "Pattern reinforced");
            pattern.id
        } else {
            self.store
                .create_pattern(
                    &attempt.alert_name,
                    category,
                    &fingerprint,
                    root_cause.as_deref(),
                    &attempt.commands_executed,
                    attempt.risk_level.map_or("medium", |r| r.as_str()),
                    target_host.as_deref(),
                )
                .await?
        };

        self.invalidate_cache().await;
        Ok(Some(pattern_id))
    }

    /// Record the outcome of applying a learned pattern.
    pub async fn record_outcome(
        &self,
        pattern_id: i64,
        success: bool,
        execution_time_secs: i32,
    ) -> EngineResult<f64> {
        let confidence = self
            .store
            .record_pattern_outcome(pattern_id, success, execution_time_secs, None)
            .await?;
        self.invalidate_cache().await;
        Ok(confidence)
    }

    /// Record a failed remediation shape so it is not repeated.
    pub async fn record_failure(
        &self,
        alert_name: &str,
        alert_instance: &str,
        commands: &[String],
        failure_reason: &str,
        symptom_fingerprint: Option<&str>,
    ) -> EngineResult<()> {
        let signature = failure_signature(alert_name, commands);
        self.store
            .record_failure_pattern(
                &signature,
                alert_name,
                alert_instance,
                symptom_fingerprint,
                commands,
                failure_reason,
            )
            .await
    }

    /// The worst failed approaches recorded for an alert, for prompt context.
    pub async fn failed_patterns(
        &self,
        alert_name: &str,
        limit: i64,
    ) -> Vec<crate::store::FailurePattern> {
        self.store
            .get_failure_patterns(alert_name, limit)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, alert_name, "Failure pattern lookup failed");
                vec![]
            })
    }

    /// Whether a command set has already failed often enough to avoid.
    pub async fn should_avoid_commands(
        &self,
        alert_name: &str,
        commands: &[String],
        min_failures: i32,
    ) -> EngineResult<Option<String>> {
        let signature = failure_signature(alert_name, commands);
        let found = self
            .store
            .find_failure_pattern(&signature, min_failures)
            .await?;

        Ok(found.map(|(count, reason)| format!("Pattern failed {count} times: {reason}")))
    }

    /// The current pattern cache, refreshed when stale.
    pub async fn cached_patterns(&self) -> Vec<Pattern> {
        {
            let cache = self.cache.read().await;
            if let Some((loaded_at, patterns)) = cache.as_ref() {
                if loaded_at.elapsed() < CACHE_TTL {
                    return patterns.clone();
                }
            }
        }

        match self.store.load_enabled_patterns().await {
            Ok(patterns) => {
                info!(pattern_count = patterns.len(), "Pattern cache refreshed");
                let mut cache = self.cache.write().await;
                *cache = Some((Instant::now(), patterns.clone()));
                patterns
            }
            Err(e) => {
                // Stale patterns beat no patterns; keep whatever we had.
                warn!(error = %e, "Pattern cache refresh failed");
                let cache = self.cache.read().await;
                cache
                    .as_ref()
                    .map(|(_, patterns)| patterns.clone())
                    .unwrap_or_default()
            }
        }
    }

    async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }
}

/// Build the symptom fingerprint for an alert: the alert name followed by
/// priority labels, then standard labels, joined with `|`. Host-shaped
/// values are normalized to a host-class token so a pattern learned on one
/// exporter port transfers to the next.
#[must_use]
pub fn build_symptom_fingerprint(alert_name: &str, labels: &HashMap<String, String>) -> String {
    let mut parts = vec![alert_name.to_string()];

    for label in PRIORITY_LABELS {
        if let Some(value) = labels.get(*label) {
            parts.push(format!("{label}:{value}"));
        }
    }

    for label in STANDARD_LABELS {
        if let Some(value) = labels.get(*label) {
            if *label == "host" || *label == "instance" {
                parts.push(normalize_host_value(label, value));
            } else {
                parts.push(format!("{label}:{value}"));
            }
        }
    }

    parts.join("|")
}

/// Reduce a host-shaped label value to its host class.
fn normalize_host_value(label: &str, value: &str) -> String {
    let lower = value.to_lowercase();
    if lower.contains("forge") {
        "host:forge".to_string()
    } else if lower.contains("haven") || lower.contains("homeassistant") {
        "host:haven".to_string()
    } else if lower.contains("outpost") || lower.contains("vps") {
        "host:outpost".to_string()
    } else if lower.contains("keep") {
        "host:keep".to_string()
    } else {
        format!("{label}:generic")
    }
}

/// Bucket an alert into a broad category.
#[must_use]
pub fn categorize_alert(alert_name: &str) -> &'static str {
    let lower = alert_name.to_lowercase();
    if lower.contains("container") || lower.contains("docker") {
        "containers"
    } else if lower.contains("disk") || lower.contains("filesystem") {
        "storage"
    } else if lower.contains("cpu") || lower.contains("memory") {
        "resources"
    } else if lower.contains("network") || lower.contains("vpn") {
        "network"
    } else if lower.contains("database") || lower.contains("postgres") || lower.contains("mysql") {
        "database"
    } else if lower.contains("ssl") || lower.contains("cert") {
        "security"
    } else {
        "system"
    }
}

/// Pull a one-line root cause out of the model's analysis text: the first
/// sentence of the first substantial line.
fn extract_root_cause(analysis: &str) -> Option<String> {
    for line in analysis.lines() {
        let line = line.trim();
        if line.len() > 20 {
            if let Some(idx) = line.find('.') {
                return Some(format!("{}.", &line[..idx]));
            }
            return Some(line.chars().take(200).collect());
        }
    }
    let fallback: String = analysis.chars().take(200).collect();
    (!fallback.is_empty()).then_some(fallback)
}

/// Similarity between an alert fingerprint and a stored pattern fingerprint.
///
/// Critical labels from the pattern must all be present in the alert or the
/// similarity clamps to 0.30. A pattern whose parts are a subset of the
/// alert's scores `min(0.95, 0.70 + |pattern|/10)`; otherwise Jaccard, with
/// a +0.15 boost when the critical labels all match.
#[must_use]
pub fn calculate_similarity(alert_fingerprint: &str, pattern_fingerprint: &str) -> f64 {
    let alert_parts: HashSet<&str> = alert_fingerprint.split('|').collect();
    let pattern_parts: HashSet<&str> = pattern_fingerprint.split('|').collect();

    if alert_parts.is_empty() || pattern_parts.is_empty() {
        return 0.0;
    }

    let pattern_critical: Vec<&&str> = pattern_parts
        .iter()
        .filter(|p| CRITICAL_PREFIXES.iter().any(|c| p.starts_with(c)))
        .collect();

    let critical_all_match = pattern_critical.iter().all(|p| alert_parts.contains(**p));
    if !pattern_critical.is_empty() && !critical_all_match {
        return 0.3;
    }

    if pattern_parts.is_subset(&alert_parts) {
        #[allow(clippy::cast_precision_loss)]
        return f64::min(0.95, 0.7 + pattern_parts.len() as f64 / 10.0);
    }

    let intersection = alert_parts.intersection(&pattern_parts).count();
    let union = alert_parts.union(&pattern_parts).count();
    #[allow(clippy::cast_precision_loss)]
    let jaccard = if union > 0 {
        intersection as f64 / union as f64
    } else {
        0.0
    };

    let boost = if !pattern_critical.is_empty() && critical_all_match {
        0.15
    } else {
        0.0
    };

    f64::min(1.0, jaccard + boost)
}

/// Rank the patterns that match an alert, best effective confidence first.
///
/// Target-host discipline: when the alert carries a `system` or
/// `remediation_host` label, a pattern with a `target_host` must match it
/// (case-insensitive), and a pattern *without* one is skipped entirely so a
/// generic pattern can never shadow a host-specific one.
#[must_use]
pub fn match_patterns(
    alert_name: &str,
    alert_labels: &HashMap<String, String>,
    patterns: &[Pattern],
    min_confidence: f64,
) -> Vec<PatternMatch> {
    let alert_fingerprint = build_symptom_fingerprint(alert_name, alert_labels);
    let alert_target_system = alert_labels
        .get("system")
        .or_else(|| alert_labels.get("remediation_host"));

    let mut matches = Vec::new();

    for pattern in patterns {
        if pattern.alert_name != alert_name {
            continue;
        }
        if pattern.success_count < MIN_SUCCESS_COUNT {
            continue;
        }
        if pattern.confidence_score < min_confidence {
            continue;
        }

        let mut target_boost = 0.0;
        match (alert_target_system, &pattern.target_host) {
            (Some(alert_target), Some(pattern_target)) => {
                if !pattern_target.eq_ignore_ascii_case(alert_target) {
                    debug!(
                        pattern_id = pattern.id,
                        pattern_target = %pattern_target,
                        alert_target = %alert_target,
                        "Pattern target mismatch"
                    );
                    continue;
                }
                target_boost = 0.1;
            }
            (Some(_), None) => {
                debug!(
                    pattern_id = pattern.id,
                    "Skipping generic pattern: alert carries a system label"
                );
                continue;
            }
            _ => {}
        }

        let similarity =
            calculate_similarity(&alert_fingerprint, &pattern.symptom_fingerprint);
        let effective_similarity = f64::min(1.0, similarity + target_boost);

        if effective_similarity >= SIMILARITY_THRESHOLD {
            matches.push(PatternMatch {
                effective_confidence: pattern.confidence_score * effective_similarity,
                similarity: effective_similarity,
                pattern: pattern.clone(),
            });
        }
    }

    matches.sort_by(|a, b| {
        b.effective_confidence
            .partial_cmp(&a.effective_confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches
}

/// Deterministic signature for a failed remediation shape:
/// `sha256(alert_name|sorted(commands))`, truncated to 32 hex chars.
#[must_use]
pub fn failure_signature(alert_name: &str, commands: &[String]) -> String {
    let mut sorted = commands.to_vec();
    sorted.sort();

    let content = format!("{alert_name}|{}", sorted.join("|"));
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(digest)[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn labels(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn pattern(
        id: i64,
        alert_name: &str,
        fingerprint: &str,
        confidence: f64,
        successes: i32,
        target_host: Option<&str>,
    ) -> Pattern {
        Pattern {
            id,
            alert_name: alert_name.to_string(),
            alert_category: "containers".to_string(),
            symptom_fingerprint: fingerprint.to_string(),
            root_cause: None,
            solution_commands: vec!["docker restart caddy".to_string()],
            success_count: successes,
            failure_count: 0,
            confidence_score: confidence,
            risk_level: "low".to_string(),
            usage_count: successes,
            avg_execution_time: None,
            target_host: target_host.map(ToString::to_string),
            enabled: true,
            created_at: Utc::now(),
            updated_at: None,
            last_used_at: None,
        }
    }

    #[test]
    fn test_fingerprint_priority_and_standard_order() {
        let fp = build_symptom_fingerprint(
            "BackupStale",
            &labels(&[
                ("system", "haven"),
                ("severity", "warning"),
                ("job", "backup"),
            ]),
        );
        // Priority labels come before standard ones; standard labels keep
        // their fixed order (job before severity).
        assert_eq!(fp, "BackupStale|system:haven|job:backup|severity:warning");
    }

    #[test]
    fn test_fingerprint_host_normalization() {
        let fp = build_symptom_fingerprint(
            "ContainerUnhealthy",
            &labels(&[("host", "forge.lan"), ("container", "caddy")]),
        );
        assert!(fp.contains("host:forge"));
        assert!(fp.contains("container:caddy"));

        let fp = build_symptom_fingerprint(
            "ContainerUnhealthy",
            &labels(&[("host", "10.0.0.99")]),
        );
        assert!(fp.contains("host:generic"));
    }

    #[test]
    fn test_similarity_subset_scales_with_specificity() {
        let alert = "A|system:haven|container:caddy|severity:warning";
        let small_pattern = "A|container:caddy";
        let big_pattern = "A|system:haven|container:caddy";

        let small = calculate_similarity(alert, small_pattern);
        let big = calculate_similarity(alert, big_pattern);
        assert!(small >= 0.7 && small <= 0.95);
        assert!(big > small, "more specific subset should score higher");
    }

    #[test]
    fn test_similarity_critical_mismatch_clamps() {
        let alert = "A|system:forge|severity:warning";
        let pattern = "A|system:haven|severity:warning";
        assert!((calculate_similarity(alert, pattern) - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_similarity_jaccard_with_critical_boost() {
        // Not a subset (pattern has an extra non-critical part), critical
        // label matches: jaccard + 0.15.
        let alert = "A|system:haven|severity:warning";
        let pattern = "A|system:haven|job:backup";
        let similarity = calculate_similarity(alert, pattern);
        // intersection {A, system:haven} = 2, union = 4 -> 0.5 + 0.15
        assert!((similarity - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_target_host_discipline() {
        let alert_labels = labels(&[("system", "forge"), ("container", "caddy")]);
        let patterns = vec![
            // Wrong host: excluded even with perfect confidence.
            pattern(1, "ContainerUnhealthy", "ContainerUnhealthy|system:haven", 0.95, 5, Some("haven")),
            // No target host: skipped because the alert carries a system label.
            pattern(2, "ContainerUnhealthy", "ContainerUnhealthy|container:caddy", 0.95, 5, None),
            // Right host: matches.
            pattern(
                3,
                "ContainerUnhealthy",
                "ContainerUnhealthy|system:forge|container:caddy",
                0.9,
                5,
                Some("forge"),
            ),
        ];

        let matches = match_patterns("ContainerUnhealthy", &alert_labels, &patterns, 0.5);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pattern.id, 3);
    }

    #[test]
    fn test_generic_pattern_matches_unlabeled_alert() {
        let alert_labels = labels(&[("container", "caddy")]);
        let patterns = vec![pattern(
            1,
            "ContainerUnhealthy",
            "ContainerUnhealthy|container:caddy",
            0.9,
            3,
            None,
        )];

        let matches = match_patterns("ContainerUnhealthy", &alert_labels, &patterns, 0.5);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn test_min_success_and_confidence_gates() {
        let alert_labels = labels(&[("container", "caddy")]);

        let too_new = vec![pattern(
            1,
            "ContainerUnhealthy",
            "ContainerUnhealthy|container:caddy",
            0.9,
            1,
            None,
        )];
        assert!(match_patterns("ContainerUnhealthy", &alert_labels, &too_new, 0.5).is_empty());

        let too_weak = vec![pattern(
            2,
            "ContainerUnhealthy",
            "ContainerUnhealthy|container:caddy",
            0.4,
            5,
            None,
        )];
        assert!(match_patterns("ContainerUnhealthy", &alert_labels, &too_weak, 0.5).is_empty());
    }

    #[test]
    fn test_failure_signature_order_independent() {
        let a = failure_signature(
            "X",
            &["systemctl restart foo".to_string(), "docker ps".to_string()],
        );
        let b = failure_signature(
            "X",
            &["docker ps".to_string(), "systemctl restart foo".to_string()],
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let c = failure_signature("Y", &["docker ps".to_string()]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_laplace_confidence_monotonicity() {
        // The SQL applies (success+1)/(success+failure+1) after the bump;
        // verify the formula's direction here at the model level.
        let confidence = |s: f64, f: f64| (s + 1.0) / (s + f + 1.0);

        let before = confidence(3.0, 1.0);
        let after_success = confidence(4.0, 1.0);
        let after_failure = confidence(3.0, 2.0);

        assert!(after_success > before);
        assert!(after_failure < before);
    }

    #[test]
    fn test_categorize_alert() {
        assert_eq!(categorize_alert("ContainerDown"), "containers");
        assert_eq!(categorize_alert("DiskSpaceLow"), "storage");
        assert_eq!(categorize_alert("HighMemoryUsage"), "resources");
        assert_eq!(categorize_alert("WireGuardVPNDown"), "network");
        assert_eq!(categorize_alert("PostgreSQLDown"), "database");
        assert_eq!(categorize_alert("SSLCertExpiring"), "security");
        assert_eq!(categorize_alert("NodeRebooted"), "system");
    }

    #[test]
    fn test_extract_root_cause_first_sentence() {
        let analysis = "short\nThe caddy container ran out of file descriptors. Restarting fixes it.";
        assert_eq!(
            extract_root_cause(analysis).as_deref(),
            Some("The caddy container ran out of file descriptors.")
        );
        assert!(extract_root_cause("").is_none());
    }
}
