//! The remediation pipeline.
//!
//! A firing alert traverses a fixed sequence of gates and steps: intake
//! validation, fingerprint dedup, attempt counting, hint extraction and
//! routing, maintenance/suppression/correlation gates, pattern lookup, plan
//! generation (learned pattern or model loop), command validation, the
//! high-risk gate, execution, metric-backed verification, and finally
//! persistence, learning, and notification (or escalation). Every terminal
//! state maps to one [`Outcome`] variant returned to the webhook caller.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::RegexBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::agent::{Analysis, AlertContext, RemediationAgent};
use crate::alerts::Alert;
use crate::clients::PrometheusClient;
use crate::config::Config;
use crate::correlate::AlertCorrelator;
use crate::escalate::Escalator;
use crate::hints::{self, Hints};
use crate::hosts::HostId;
use crate::learning::{LearningEngine, PatternDecision};
use crate::metrics;
use crate::queue::AlertQueue;
use crate::runbooks::RunbookManager;
use crate::ssh::SshExecutor;
use crate::store::{FingerprintDecision, RemediationAttempt, Store};
use crate::suppress::AlertSuppressor;
use crate::validator::{CommandValidator, RiskLevel};
use notify::{Notifier, NotifyEvent};

/// Terminal state of one alert's trip through the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Remediated {
        duration_seconds: i64,
        verified: bool,
        verification_message: String,
        pattern_used: bool,
    },
    Failed {
        reason: String,
        attempt: i64,
    },
    Escalated {
        reason: String,
        attempts: i64,
    },
    Suppressed {
        reason: String,
    },
    Skipped {
        reason: String,
    },
    Rejected {
        reasons: Vec<String>,
    },
    Deduplicated {
        reason: String,
    },
    DiagnosticOnly {
        commands: Vec<String>,
    },
    NoAction {
        reason: String,
        attempt: i64,
    },
    Error {
        message: String,
    },
}

impl Outcome {
    /// Short label for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Remediated { .. } => "remediated",
            Self::Failed { .. } => "failed",
            Self::Escalated { .. } => "escalated",
            Self::Suppressed { .. } => "suppressed",
            Self::Skipped { .. } => "skipped",
            Self::Rejected { .. } => "rejected",
            Self::Deduplicated { .. } => "deduplicated",
            Self::DiagnosticOnly { .. } => "diagnostic_only",
            Self::NoAction { .. } => "no_action",
            Self::Error { .. } => "error",
        }
    }
}

/// Read-only command shapes that never count as a remediation attempt.
const DIAGNOSTIC_PATTERNS: &[&str] = &[
    // Docker read-only
    r"^docker\s+ps",
    r"^docker\s+logs",
    r"^docker\s+inspect",
    r"^docker\s+stats",
    r"^docker\s+images",
    r"^docker\s+port",
    r"^docker\s+top",
    r"^docker\s+events",
    r"^docker\s+info",
    r"^docker\s+version",
    r"^docker\s+compose\s+(ps|logs|config|images|ls)",
    // Systemd read-only
    r"^systemctl\s+status",
    r"^systemctl\s+is-active",
    r"^systemctl\s+is-enabled",
    r"^systemctl\s+is-failed",
    r"^systemctl\s+show",
    r"^systemctl\s+list-",
    r"^journalctl",
    // Network diagnostics
    r"^curl\s+.*-[IfsSkLv]",
    r"^curl\s+--head",
    r"^wget\s+--spider",
    r"^ping",
    r"^traceroute",
    r"^tracepath",
    r"^dig\s",
    r"^nslookup",
    r"^host\s",
    r"^netstat",
    r"^ss\s+-",
    r"^ip\s+(addr|link|route|neigh)",
    // System information
    r"^uptime",
    r"^free",
    r"^df",
    r"^du\s",
    r"^top\s+-b",
    r"^vmstat",
    r"^iostat",
    r"^mpstat",
    r"^w$",
    r"^who$",
    r"^whoami",
    r"^hostname",
    r"^uname",
    r"^lscpu",
    r"^lsmem",
    // File system read-only
    r"^ls(\s|$)",
    r"^cat\s",
    r"^head\s",
    r"^tail\s",
    r"^less\s",
    r"^more\s",
    r"^grep\s",
    r"^find\s",
    r"^stat\s",
    r"^file\s",
    r"^wc\s",
    r"^diff\s",
    r"^md5sum",
    r"^sha\d+sum",
    // Process/system lookup
    r"^which\s",
    r"^whereis\s",
    r"^type\s",
    r"^ps\s+(aux|-ef)",
    r"^pgrep",
    r"^pidof",
    r"^dmesg",
    r"^lsblk",
    r"^lsof",
    r"^lspci",
    r"^lsusb",
    r"^fdisk\s+-l",
    r"^blkid",
    // Home automation read-only
    r"^ha\s+core\s+(info|check|stats)",
    r"^ha\s+info",
    r"^ha\s+backups\s+list",
    r"^ha\s+addons\s+info",
    r"^ha\s+network\s+info",
    // Database read-only
    r#"^psql\s+-c\s+["']SELECT"#,
    r#"^sqlite3\s+.*\s+["']SELECT"#,
    // Diagnostic output
    r"^echo\s",
    r"^printf\s",
];

static COMPILED_DIAGNOSTIC: Lazy<Vec<regex::Regex>> = Lazy::new(|| {
    DIAGNOSTIC_PATTERNS
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .unwrap_or_else(|e| panic!("invalid diagnostic pattern {pattern:?}: {e}"))
        })
        .collect()
});

/// Whether a command changes system state (vs. read-only diagnostics).
#[must_use]
pub fn is_actionable_command(command: &str) -> bool {
    let command = command.trim();
    !COMPILED_DIAGNOSTIC.iter().any(|re| re.is_match(command))
}

/// Command shapes simple enough to execute even under a HIGH risk verdict.
const SIMPLE_COMMAND_PATTERNS: &[&str] = &[
    r"^(sudo\s+)?systemctl\s+restart\s+",
    r"^(sudo\s+)?systemctl\s+status\s+",
    r"^docker\s+restart\s+",
    r"^docker\s+ps\b",
    r"^docker\s+logs\b",
    r"^ha\s+core\s+restart",
    r"^journalctl\s+",
];

static COMPILED_SIMPLE: Lazy<Vec<regex::Regex>> = Lazy::new(|| {
    SIMPLE_COMMAND_PATTERNS
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .unwrap_or_else(|e| panic!("invalid simple pattern {pattern:?}: {e}"))
        })
        .collect()
});

/// Whether every command in the plan is a simple restart/status/log shape.
#[must_use]
pub fn all_commands_simple(commands: &[String]) -> bool {
    !commands.is_empty()
        && commands.iter().all(|cmd| {
            let cmd = cmd.trim();
            COMPILED_SIMPLE.iter().any(|re| re.is_match(cmd))
        })
}

/// The pipeline coordinator. Owns the lifecycle of an in-flight alert.
pub struct Pipeline {
    config: Arc<Config>,
    store: Arc<Store>,
    queue: Arc<AlertQueue>,
    suppressor: Arc<AlertSuppressor>,
    correlator: Arc<AlertCorrelator>,
    learning: Arc<LearningEngine>,
    agent: Arc<RemediationAgent>,
    ssh: Arc<SshExecutor>,
    prometheus: PrometheusClient,
    escalator: Arc<Escalator>,
    notifier: Arc<Notifier>,
    runbooks: Arc<std::sync::RwLock<RunbookManager>>,
    validator: CommandValidator,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        queue: Arc<AlertQueue>,
        suppressor: Arc<AlertSuppressor>,
        correlator: Arc<AlertCorrelator>,
        learning: Arc<LearningEngine>,
        agent: Arc<RemediationAgent>,
        ssh: Arc<SshExecutor>,
        prometheus: PrometheusClient,
        escalator: Arc<Escalator>,
        notifier: Arc<Notifier>,
        runbooks: Arc<std::sync::RwLock<RunbookManager>>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            suppressor,
            correlator,
            learning,
            agent,
            ssh,
            prometheus,
            escalator,
            notifier,
            runbooks,
            validator: CommandValidator::new(),
        }
    }

    /// Process one firing alert through the full state machine.
    pub async fn process_alert(&self, alert: &Alert) -> Outcome {
        let alert_name = alert.name().to_string();
        metrics::record_alert_received(&alert_name, alert.severity());
        metrics::active_remediations_add(1);

        let outcome = self.run_pipeline(alert, &alert_name).await;

        metrics::record_outcome(&alert_name, outcome.label());
        metrics::active_remediations_add(-1);
        outcome
    }

    async fn run_pipeline(&self, alert: &Alert, alert_name: &str) -> Outcome {
        // --- Intake ---------------------------------------------------------
        let fingerprint = match alert.normalized_fingerprint() {
            Ok(fp) => fp,
            Err(e) => {
                error!(alert_name, error = %e, "Invalid alert fingerprint");
                return Outcome::Error {
                    message: "Invalid or missing alert fingerprint".to_string(),
                };
            }
        };
        let alert_instance = alert.identity_instance();

        // --- Dedup ----------------------------------------------------------
        let (decision, last_processed) = self
            .store
            .check_and_set_fingerprint(
                &fingerprint,
                alert_name,
                &alert_instance,
                self.config.fingerprint_cooldown_seconds,
            )
            .await;

        if decision == FingerprintDecision::InCooldown {
            info!(
                alert_name,
                alert_instance,
                fingerprint = &fingerprint[..fingerprint.len().min(16)],
                last_processed = ?last_processed,
                "Alert deduplicated"
            );
            return Outcome::Deduplicated {
                reason: format!(
                    "Same fingerprint processed within {}s",
                    self.config.fingerprint_cooldown_seconds
                ),
            };
        }

        info!(alert_name, alert_instance, "Processing alert");

        // --- Attempt counter ------------------------------------------------
        let attempt_count = match self
            .store
            .get_attempt_count(
                alert_name,
                &alert_instance,
                self.config.attempt_window_hours,
            )
            .await
        {
            Ok(count) => count,
            Err(e) => {
                error!(alert_name, error = %e, "Attempt count query failed");
                return Outcome::Error {
                    message: format!("attempt count unavailable: {e}"),
                };
            }
        };

        if attempt_count >= self.config.max_attempts_per_alert {
            warn!(alert_name, attempts = attempt_count, "Max attempts reached");
            self.escalator
                .escalate(
                    alert_name,
                    &alert_instance,
                    &fingerprint,
                    alert.severity(),
                    attempt_count,
                    None,
                )
                .await;
            return Outcome::Escalated {
                reason: "max attempts reached".to_string(),
                attempts: attempt_count,
            };
        }

        // --- Hints + routing ------------------------------------------------
        let alert_hints = hints::extract_hints(alert);
        let target_host = hints::determine_target_host(alert, &alert_hints);
        let service_name = hints::extract_service_name(alert);
        let service_kind = hints::determine_service_kind(alert, service_name.as_deref());

        info!(
            alert_name,
            target_host = %target_host,
            service_name = service_name.as_deref().unwrap_or("unknown"),
            service_kind = service_kind.as_str(),
            hint_host = alert_hints.target_host.as_deref(),
            "Alert context determined"
        );

        // --- Maintenance gate -----------------------------------------------
        match self
            .store
            .active_maintenance_window(target_host.as_str())
            .await
        {
            Ok(Some(window)) => {
                if let Err(e) = self.store.increment_maintenance_suppression(window.id).await {
                    warn!(error = %e, "Maintenance suppression counter update failed");
                }
                let scope = window.host.as_deref().unwrap_or("all hosts");
                info!(
                    alert_name,
                    window_id = window.id,
                    scope,
                    "Alert suppressed by maintenance window"
                );
                return Outcome::Suppressed {
                    reason: format!("Maintenance mode ({scope})"),
                };
            }
            Ok(None) => {}
            Err(e) => {
                error!(alert_name, error = %e, "Maintenance window lookup failed");
                return Outcome::Error {
                    message: format!("maintenance lookup failed: {e}"),
                };
            }
        }

        // --- Suppression gate -----------------------------------------------
        if let Some(reason) = self
            .suppressor
            .should_suppress(alert_name, alert.severity(), target_host)
            .await
        {
            info!(alert_name, alert_instance, reason, "Alert suppressed");
            return Outcome::Suppressed { reason };
        }
        self.suppressor.register_root_cause(alert_name).await;

        // --- Correlation gate -----------------------------------------------
        let mut correlation_context = String::new();
        if let Some(incident) = self.correlator.correlate_alert(alert).await {
            info!(
                alert_name,
                root_cause = %incident.root_cause_alert,
                correlation_type = incident.correlation_type,
                "Alert correlated"
            );

            if AlertCorrelator::should_skip_alert(alert_name, Some(&incident)) {
                info!(
                    alert_name,
                    root_cause = %incident.root_cause_alert,
                    "Alert skipped: root cause is being handled"
                );
                return Outcome::Skipped {
                    reason: format!(
                        "Correlated with {} (root cause)",
                        incident.root_cause_alert
                    ),
                };
            }

            correlation_context = self.correlator.correlation_context(alert).await;
        }

        // --- Pattern lookup ---------------------------------------------------
        let mut pattern_decision = self
            .learning
            .pattern_decision(alert_name, &alert.labels)
            .await;

        // A pattern whose command set is a chronic failure for this alert is
        // demoted to context: the model gets to try something else.
        let demoted = if let PatternDecision::UseDirectly(matched) = &pattern_decision {
            match self
                .learning
                .should_avoid_commands(alert_name, &matched.pattern.solution_commands, 2)
                .await
            {
                Ok(Some(reason)) => {
                    warn!(
                        pattern_id = matched.pattern.id,
                        reason, "Learned pattern demoted: commands match a failure pattern"
                    );
                    Some(matched.clone())
                }
                _ => None,
            }
        } else {
            None
        };
        if let Some(matched) = demoted {
            pattern_decision = PatternDecision::AsContext(matched);
        }

        let start_time = Utc::now();
        let mut pattern_used_id: Option<i64> = None;

        // --- Plan -------------------------------------------------------------
        let analysis = match &pattern_decision {
            PatternDecision::UseDirectly(matched) => {
                pattern_used_id = Some(matched.pattern.id);
                metrics::record_pattern_match(true);
                info!(
                    pattern_id = matched.pattern.id,
                    commands = ?matched.pattern.solution_commands,
                    "Applying learned pattern"
                );
                pattern_analysis(matched)
            }
            decision => {
                metrics::record_pattern_match(false);
                let pattern_context = if let PatternDecision::AsContext(matched) = decision {
                    Some(matched)
                } else {
                    None
                };

                let failed_approaches = self.learning.failed_patterns(alert_name, 3).await;
                let system_context = self.build_system_context(
                    alert,
                    target_host,
                    service_name.as_deref(),
                    &alert_hints,
                    &correlation_context,
                    pattern_context,
                    &failed_approaches,
                );
                let runbook_context = {
                    let runbooks = self.runbooks.read().expect("runbook lock");
                    runbooks.context_for(alert_name)
                };
                let context = AlertContext {
                    alert_name: alert_name.to_string(),
                    alert_instance: alert_instance.clone(),
                    severity: alert.severity().to_string(),
                    description: alert.description().to_string(),
                };

                match self
                    .agent
                    .analyze_alert(&context, &system_context, runbook_context.as_deref())
                    .await
                {
                    Ok(analysis) => analysis,
                    Err(e) => {
                        error!(alert_name, error = %e, "Model analysis failed");

                        let mut attempt = self.base_attempt(
                            alert,
                            &alert_instance,
                            &fingerprint,
                            attempt_count + 1,
                        );
                        attempt.error_message = Some(format!("model analysis failed: {e}"));
                        attempt.risk_level = Some(RiskLevel::High);
                        attempt.escalated = true;
                        self.queue.persist_or_queue(attempt).await;

                        return Outcome::Failed {
                            reason: "model analysis failed".to_string(),
                            attempt: attempt_count + 1,
                        };
                    }
                }
            }
        };

        // --- Validate plan ----------------------------------------------------
        let validation = self.validator.validate_commands(&analysis.commands);

        if !validation.safe {
            warn!(
                alert_name,
                rejected = ?validation.rejected_commands,
                "Unsafe commands detected"
            );

            self.notifier.notify(NotifyEvent::UnsafePlan {
                alert_name: alert_name.to_string(),
                alert_instance: alert_instance.clone(),
                rejected_commands: validation.rejected_commands.clone(),
                reasons: validation.rejection_reasons.clone(),
                timestamp: Utc::now(),
            });

            let mut attempt =
                self.base_attempt(alert, &alert_instance, &fingerprint, attempt_count + 1);
            attempt.ai_analysis = Some(analysis.analysis.clone());
            attempt.ai_reasoning = Some(analysis.reasoning.clone());
            attempt.remediation_plan = Some(analysis.expected_outcome.clone());
            attempt.error_message = Some("Unsafe commands rejected".to_string());
            attempt.risk_level = Some(RiskLevel::High);
            attempt.escalated = true;
            self.queue.persist_or_queue(attempt).await;

            return Outcome::Rejected {
                reasons: validation.rejection_reasons,
            };
        }

        // --- Risk gate --------------------------------------------------------
        if analysis.risk == RiskLevel::High
            && !all_commands_simple(&validation.validated_commands)
        {
            warn!(
                alert_name,
                reasoning = %analysis.reasoning,
                has_commands = !validation.validated_commands.is_empty(),
                "High-risk remediation escalated"
            );

            let mut attempt =
                self.base_attempt(alert, &alert_instance, &fingerprint, attempt_count + 1);
            attempt.ai_analysis = Some(analysis.analysis.clone());
            attempt.ai_reasoning = Some(analysis.reasoning.clone());
            attempt.remediation_plan = Some(analysis.expected_outcome.clone());
            attempt.error_message = Some("Risk level too high for auto-remediation".to_string());
            attempt.risk_level = Some(RiskLevel::High);
            attempt.escalated = true;
            self.queue.persist_or_queue(attempt).await;

            self.escalator
                .escalate(
                    alert_name,
                    &alert_instance,
                    &fingerprint,
                    alert.severity(),
                    attempt_count + 1,
                    Some(&analysis.reasoning),
                )
                .await;

            return Outcome::Escalated {
                reason: "high_risk".to_string(),
                attempts: attempt_count + 1,
            };
        }

        if analysis.risk == RiskLevel::High {
            info!(
                alert_name,
                commands = ?validation.validated_commands,
                "High risk verdict overridden: plan is simple validated restarts"
            );
        }

        // --- No commands ------------------------------------------------------
        if validation.validated_commands.is_empty() {
            info!(alert_name, "No commands to execute");

            let duration = (Utc::now() - start_time).num_seconds();
            let mut attempt =
                self.base_attempt(alert, &alert_instance, &fingerprint, attempt_count + 1);
            attempt.ai_analysis = Some(analysis.analysis.clone());
            attempt.ai_reasoning = Some(analysis.reasoning.clone());
            attempt.remediation_plan = Some(analysis.expected_outcome.clone());
            attempt.error_message = Some("No commands generated".to_string());
            attempt.execution_duration_seconds = Some(duration as i32);
            attempt.risk_level = Some(analysis.risk);
            self.queue.persist_or_queue(attempt).await;

            if attempt_count + 1 >= self.config.max_attempts_per_alert {
                self.escalator
                    .escalate(
                        alert_name,
                        &alert_instance,
                        &fingerprint,
                        alert.severity(),
                        attempt_count + 1,
                        Some(&analysis.reasoning),
                    )
                    .await;
            }

            return Outcome::NoAction {
                reason: "No validated commands".to_string(),
                attempt: attempt_count + 1,
            };
        }

        // --- Classify + execute ----------------------------------------------
        let actionable: Vec<String> = validation
            .validated_commands
            .iter()
            .filter(|cmd| is_actionable_command(cmd))
            .cloned()
            .collect();
        let diagnostic: Vec<String> = validation
            .validated_commands
            .iter()
            .filter(|cmd| !is_actionable_command(cmd))
            .cloned()
            .collect();

        info!(
            alert_name,
            total_commands = validation.validated_commands.len(),
            actionable_commands = actionable.len(),
            diagnostic_commands = diagnostic.len(),
            "Executing remediation"
        );

        let execution = self
            .ssh
            .execute_commands(
                target_host,
                &validation.validated_commands,
                Some(self.config.command_execution_timeout),
            )
            .await;

        let duration = (Utc::now() - start_time).num_seconds();

        // Diagnostic-only plans leave no attempt record; nothing changed.
        if actionable.is_empty() {
            info!(alert_name, commands = ?diagnostic, "Diagnostic-only run, no attempt logged");
            return Outcome::DiagnosticOnly {
                commands: diagnostic,
            };
        }

        let mut attempt =
            self.base_attempt(alert, &alert_instance, &fingerprint, attempt_count + 1);
        attempt.ai_analysis = Some(analysis.analysis.clone());
        attempt.ai_reasoning = Some(analysis.reasoning.clone());
        attempt.remediation_plan = Some(analysis.expected_outcome.clone());
        attempt.commands_executed = execution.commands.clone();
        attempt.command_outputs = execution.outputs.clone();
        attempt.exit_codes = execution.exit_codes.clone();
        attempt.success = execution.success;
        attempt.error_message = execution.error.clone();
        attempt.execution_duration_seconds = Some(duration as i32);
        attempt.risk_level = Some(analysis.risk);

        metrics::record_duration(alert_name, duration as f64);

        if execution.success {
            // --- Verify -------------------------------------------------------
            let (verified, verification_message) = self
                .verify(alert, alert_name, &alert_instance)
                .await;

            if verified {
                self.queue.persist_or_queue(attempt.clone()).await;
                self.notifier.notify(NotifyEvent::RemediationSucceeded {
                    alert_name: alert_name.to_string(),
                    alert_instance: alert_instance.clone(),
                    attempt_number: attempt.attempt_number,
                    max_attempts: self.config.max_attempts_per_alert as i32,
                    duration_secs: duration,
                    analysis: analysis.analysis.clone(),
                    commands: execution.commands.clone(),
                    timestamp: Utc::now(),
                });

                self.record_learning_success(&attempt, alert, pattern_used_id, duration)
                    .await;

                return Outcome::Remediated {
                    duration_seconds: duration,
                    verified,
                    verification_message,
                    pattern_used: pattern_used_id.is_some(),
                };
            }

            // The shell said yes but the alert is still firing: verification
            // overrides exit codes.
            attempt.success = false;
            attempt.error_message = Some(format!(
                "Commands succeeded but alert not resolved: {verification_message}"
            ));
            self.queue.persist_or_queue(attempt.clone()).await;

            self.record_learning_failure(
                &attempt,
                &alert_instance,
                pattern_used_id,
                &actionable,
                &verification_message,
                duration,
            )
            .await;

            self.notify_failure(&attempt, duration).await;

            if attempt_count + 1 >= self.config.max_attempts_per_alert {
                self.escalator
                    .escalate(
                        alert_name,
                        &alert_instance,
                        &fingerprint,
                        alert.severity(),
                        attempt_count + 1,
                        Some(&analysis.reasoning),
                    )
                    .await;
            }

            return Outcome::Failed {
                reason: format!("verification failed: {verification_message}"),
                attempt: attempt_count + 1,
            };
        }

        // --- Shell-level failure ---------------------------------------------
        self.queue.persist_or_queue(attempt.clone()).await;

        if let Some(pattern_id) = pattern_used_id {
            if let Err(e) = self
                .learning
                .record_outcome(pattern_id, false, duration as i32)
                .await
            {
                warn!(error = %e, pattern_id, "Pattern outcome recording failed");
            }
        }

        self.notify_failure(&attempt, duration).await;

        if attempt_count + 1 >= self.config.max_attempts_per_alert {
            self.escalator
                .escalate(
                    alert_name,
                    &alert_instance,
                    &fingerprint,
                    alert.severity(),
                    attempt_count + 1,
                    Some(&analysis.reasoning),
                )
                .await;
        }

        Outcome::Failed {
            reason: execution
                .error
                .unwrap_or_else(|| "command execution failed".to_string()),
            attempt: attempt_count + 1,
        }
    }

    /// Handle one resolved alert: clear attempts and cooldowns so the next
    /// incident starts fresh, and drop any registered root cause.
    pub async fn handle_resolved(&self, alert: &Alert) {
        let alert_name = alert.name();
        let alert_instance = alert.identity_instance();

        let cleared = match self.store.clear_attempts(alert_name, &alert_instance).await {
            Ok(count) => count,
            Err(e) => {
                warn!(alert_name, error = %e, "Attempt clearing failed on resolution");
                0
            }
        };

        let cooldown_cleared = match self
            .store
            .clear_escalation_cooldown(alert_name, &alert_instance)
            .await
        {
            Ok(cleared) => cleared,
            Err(e) => {
                warn!(alert_name, error = %e, "Cooldown clearing failed on resolution");
                false
            }
        };

        self.suppressor.clear_root_cause(alert_name).await;

        info!(
            alert_name,
            alert_instance,
            cleared_attempts = cleared,
            escalation_cooldown_cleared = cooldown_cleared,
            "Alert resolved, state cleared"
        );
    }

    /// Run metric-backed verification for an executed plan.
    ///
    /// A backend error falls back to trusting exit codes (with an explicit
    /// message) rather than failing the attempt.
    async fn verify(
        &self,
        alert: &Alert,
        alert_name: &str,
        alert_instance: &str,
    ) -> (bool, String) {
        if !self.config.verification_enabled {
            return (true, "Verification skipped".to_string());
        }

        let mut verification_labels = HashMap::new();
        for key in ["system", "container"] {
            if let Some(value) = alert.labels.get(key) {
                verification_labels.insert(key.to_string(), value.clone());
            }
        }

        // A synthetic host:container identity is not a real instance label.
        let instance_matcher = if alert_instance.contains(':') {
            None
        } else {
            Some(alert_instance)
        };

        let (verified, message) = self
            .prometheus
            .verify_remediation(
                alert_name,
                instance_matcher,
                if verification_labels.is_empty() {
                    None
                } else {
                    Some(&verification_labels)
                },
                self.config.verification_max_wait,
                self.config.verification_poll_interval,
                self.config.verification_initial_delay,
            )
            .await;

        info!(alert_name, verified, message, "Verification result");
        (verified, message)
    }

    async fn record_learning_success(
        &self,
        attempt: &RemediationAttempt,
        alert: &Alert,
        pattern_used_id: Option<i64>,
        duration: i64,
    ) {
        if let Some(pattern_id) = pattern_used_id {
            match self
                .learning
                .record_outcome(pattern_id, true, duration as i32)
                .await
            {
                Ok(confidence) => {
                    info!(pattern_id, new_confidence = confidence, "Pattern outcome recorded");
                }
                Err(e) => warn!(error = %e, pattern_id, "Pattern outcome recording failed"),
            }
        } else {
            // A model-generated fix that verified: learn it.
            match self.learning.extract_pattern(attempt, &alert.labels).await {
                Ok(Some(pattern_id)) => {
                    info!(pattern_id, alert_name = %attempt.alert_name, "Pattern learned");
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Pattern extraction failed"),
            }
        }
    }

    async fn record_learning_failure(
        &self,
        attempt: &RemediationAttempt,
        alert_instance: &str,
        pattern_used_id: Option<i64>,
        actionable: &[String],
        failure_reason: &str,
        duration: i64,
    ) {
        if let Some(pattern_id) = pattern_used_id {
            if let Err(e) = self
                .learning
                .record_outcome(pattern_id, false, duration as i32)
                .await
            {
                warn!(error = %e, pattern_id, "Pattern outcome recording failed");
            }
        }

        if !actionable.is_empty() {
            if let Err(e) = self
                .learning
                .record_failure(
                    &attempt.alert_name,
                    alert_instance,
                    actionable,
                    failure_reason,
                    None,
                )
                .await
            {
                warn!(error = %e, "Failure pattern recording failed");
            }
        }
    }

    async fn notify_failure(&self, attempt: &RemediationAttempt, duration: i64) {
        self.notifier.notify(NotifyEvent::RemediationFailed {
            alert_name: attempt.alert_name.clone(),
            alert_instance: attempt.alert_instance.clone(),
            attempt_number: attempt.attempt_number,
            max_attempts: self.config.max_attempts_per_alert as i32,
            error: attempt
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
            commands: attempt.commands_executed.clone(),
            timestamp: Utc::now(),
        });
        metrics::record_duration(&attempt.alert_name, duration as f64);
    }

    fn base_attempt(
        &self,
        alert: &Alert,
        alert_instance: &str,
        fingerprint: &str,
        attempt_number: i64,
    ) -> RemediationAttempt {
        RemediationAttempt::new(
            alert.name(),
            alert_instance,
            fingerprint,
            alert.severity(),
            i32::try_from(attempt_number).unwrap_or(i32::MAX),
        )
    }

    /// Assemble the system context handed to the model.
    fn build_system_context(
        &self,
        alert: &Alert,
        target_host: HostId,
        service_name: Option<&str>,
        alert_hints: &Hints,
        correlation_context: &str,
        pattern_context: Option<&crate::learning::PatternMatch>,
        failed_approaches: &[crate::store::FailurePattern],
    ) -> String {
        let related = hints::related_hosts(alert, alert_hints);
        let cross_system_note = if related.len() > 1 {
            let host_names: Vec<&str> = related.iter().map(HostId::as_str).collect();
            format!(
                "\n## CROSS-SYSTEM ALERT - CHECK MULTIPLE HOSTS\nThis alert type often has root causes on MULTIPLE systems.\n**You should investigate: {}**\nFor VPN issues, check both endpoints - the problem might be routing, interface names, or config on either end.\n",
                host_names.join(", ")
            )
        } else {
            String::new()
        };

        let mut context = format!(
            r"# Homelab System: {target}
# Alert Type: {alert_name}
# Service: {service}
# Instance: {instance}
{cross_system_note}
This is a small homelab fleet. Systems available:
- forge ({forge_addr}): Docker host with most services, WireGuard endpoint
- haven ({haven_addr}): Home automation hub
- outpost ({outpost_addr}): Cloud VPS gateway with the orchestrator and the other WireGuard endpoint
- keep ({keep_addr}): Runs the remediation engine and its database

Common issues and fixes:
- Container crashes: docker restart <container>
- Systemd service down: sudo systemctl restart <service>
- WireGuard VPN down: sudo systemctl restart wg-quick@wg0 (check BOTH forge AND outpost)
- Home automation unresponsive: ha core restart
",
            target = target_host.as_str().to_uppercase(),
            alert_name = alert.name(),
            service = service_name.unwrap_or("unknown"),
            instance = alert.raw_instance(),
            forge_addr = self.config.forge.address,
            haven_addr = self.config.haven.address,
            outpost_addr = self.config.outpost.address,
            keep_addr = self.config.keep.address,
        );

        let mut hint_lines = Vec::new();
        if let Some(hint) = &alert_hints.remediation_hint {
            hint_lines.push(format!("- Hint: {hint}"));
        }
        if let Some(service) = &alert_hints.service {
            hint_lines.push(format!("- Service label: {service}"));
        }
        if let Some(container) = &alert_hints.container {
            hint_lines.push(format!("- Container label: {container}"));
        }
        if let Some(job) = &alert_hints.job {
            hint_lines.push(format!("- Job label: {job}"));
        }
        if let Some(url) = &alert_hints.runbook_url {
            hint_lines.push(format!("- Runbook: {url}"));
        }
        if !hint_lines.is_empty() {
            context.push_str(&format!("\n## Alert Hints\n{}\n", hint_lines.join("\n")));
        }

        if let Some(hint) = &alert_hints.suggested_remediation {
            context.push_str(&format!("\n## Suggested Remediation (from alert rule)\n{hint}\n"));
        }
        if let Some(command) = &alert_hints.system_specific_command {
            context.push_str(&format!(
                "\n## System-Specific Command\nThe alert's system label maps to this fix:\n```bash\n{command}\n```\n"
            ));
        }

        if !failed_approaches.is_empty() {
            context.push_str("\n## Approaches That Already Failed\nDo not repeat these without a different diagnosis:\n");
            for failure in failed_approaches {
                context.push_str(&format!(
                    "- {} (failed {}x: {})\n",
                    failure.commands_attempted.join("; "),
                    failure.failure_count,
                    failure.failure_reason,
                ));
            }
        }

        if let Some(matched) = pattern_context {
            let pattern = &matched.pattern;
            let total = pattern.success_count + pattern.failure_count;
            context.push_str(&format!(
                "\n\n## Historical Pattern (Confidence: {:.0}%)\nPrevious successful fixes for similar issues:\nRoot Cause: {}\nSolution: {}\nSuccess Rate: {}/{}\n\nYou may use this pattern if it applies, or suggest a different approach if needed.\n",
                pattern.confidence_score * 100.0,
                pattern.root_cause.as_deref().unwrap_or("Unknown"),
                pattern.solution_commands.join(", "),
                pattern.success_count,
                total,
            ));
        }

        context.push_str(correlation_context);
        context
    }
}

/// Synthesize an analysis from a high-confidence learned pattern.
fn pattern_analysis(matched: &crate::learning::PatternMatch) -> Analysis {
    let pattern = &matched.pattern;
    crate::agent::parse_analysis(
        &serde_json::json!({
            "analysis": format!(
                "Using learned pattern (confidence: {:.0}%)",
                matched.effective_confidence * 100.0
            ),
            "commands": pattern.solution_commands,
            "risk": pattern.risk_level,
            "expected_outcome": "Apply known solution",
            "reasoning": pattern.root_cause.clone().unwrap_or_else(|| "Historical pattern match".to_string()),
            "estimated_duration": "30 seconds",
        })
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_classification() {
        let diagnostic = [
            "docker ps -a",
            "docker logs --tail 50 caddy",
            "systemctl status nginx",
            "journalctl -u nginx -n 100",
            "curl -I http://localhost",
            "ping -c 1 forge",
            "df -h",
            "free -m",
            "uptime",
            "ls -la /var/log",
            "cat /etc/hosts",
            "grep error /var/log/syslog",
            "ps aux",
            "echo hello",
            "ha core info",
        ];
        for cmd in diagnostic {
            assert!(!is_actionable_command(cmd), "expected diagnostic: {cmd}");
        }

        let actionable = [
            "docker restart caddy",
            "systemctl restart nginx",
            "docker compose up -d",
            "ha core restart",
            "rm /tmp/lockfile",
            "docker start caddy",
        ];
        for cmd in actionable {
            assert!(is_actionable_command(cmd), "expected actionable: {cmd}");
        }
    }

    #[test]
    fn test_all_commands_simple() {
        assert!(all_commands_simple(&[
            "docker restart caddy".to_string(),
            "systemctl restart nginx".to_string(),
        ]));
        assert!(all_commands_simple(&["sudo systemctl restart wg-quick@wg0".to_string()]));

        // One non-simple command poisons the plan.
        assert!(!all_commands_simple(&[
            "docker restart caddy".to_string(),
            "docker network prune -f".to_string(),
        ]));
        // Empty plans are not simple.
        assert!(!all_commands_simple(&[]));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            Outcome::Deduplicated {
                reason: String::new()
            }
            .label(),
            "deduplicated"
        );
        assert_eq!(
            Outcome::Remediated {
                duration_seconds: 1,
                verified: true,
                verification_message: String::new(),
                pattern_used: false,
            }
            .label(),
            "remediated"
        );
    }

    #[test]
    fn test_outcome_serialization_shape() {
        let outcome = Outcome::Suppressed {
            reason: "Cascading from WireGuardVPNDown".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "suppressed");
        assert_eq!(json["reason"], "Cascading from WireGuardVPNDown");
    }
}
