//! Self-preservation: restarting the engine (or its dependencies) without
//! losing in-flight remediation.
//!
//! The validator refuses any generated command that touches warden or its
//! database, and the process would die mid-execution anyway. Instead the
//! engine serializes the in-flight remediation context into a handoff row,
//! triggers the external orchestrator's restart workflow, and resumes from
//! the saved context when the orchestrator calls back `/resume` after the
//! health endpoint goes green.
//!
//! At most one handoff may be in a non-terminal state; creation runs under a
//! transactional advisory lock so concurrent initiators cannot both win.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::Row;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::store::{HandoffRow, Store};
use crate::workflow::WorkflowClient;
use notify::{Notifier, NotifyEvent};

/// Advisory lock key serializing handoff creation.
const HANDOFF_LOCK_KEY: i64 = 123_456_789;

/// Webhook path of the orchestrator's self-restart workflow.
const SELF_RESTART_WEBHOOK: &str = "warden-self-restart";

/// Commands kept in a serialized context.
const MAX_CONTEXT_COMMANDS: usize = 50;
/// Bytes kept per command output.
const MAX_OUTPUT_LEN: usize = 10_000;
/// Bytes kept per AI text field.
const MAX_ANALYSIS_LEN: usize = 20_000;
/// Planned commands kept.
const MAX_PLANNED_COMMANDS: usize = 20;

/// Valid targets for self-restart operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartTarget {
    /// The engine container itself
    Engine,
    /// The engine's database
    EngineDb,
    /// The full host the engine runs on
    Host,
    /// The Docker daemon on the engine's host
    DockerDaemon,
}

impl RestartTarget {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::EngineDb => "engine_db",
            Self::Host => "host",
            Self::DockerDaemon => "docker_daemon",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "engine" => Some(Self::Engine),
            "engine_db" => Some(Self::EngineDb),
            "host" => Some(Self::Host),
            "docker_daemon" => Some(Self::DockerDaemon),
            _ => None,
        }
    }

    /// The shell command the orchestrator runs for this target.
    #[must_use]
    pub const fn restart_command(&self) -> &'static str {
        match self {
            Self::Engine => "docker restart warden",
            Self::EngineDb => "docker restart postgres-warden && sleep 10 && docker restart warden",
            Self::DockerDaemon => "sudo systemctl restart docker",
            Self::Host => "sudo reboot",
        }
    }
}

/// Serializable snapshot of an in-flight remediation.
///
/// This is everything needed to resume after a restart. Serialization caps
/// the large fields so a pathological remediation cannot blow up the row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationContext {
    pub alert_name: String,
    pub alert_instance: String,
    pub alert_fingerprint: String,
    pub severity: String,
    pub attempt_number: i32,
    #[serde(default)]
    pub commands_executed: Vec<String>,
    #[serde(default)]
    pub command_outputs: Vec<String>,
    #[serde(default)]
    pub ai_analysis: Option<String>,
    #[serde(default)]
    pub ai_reasoning: Option<String>,
    #[serde(default)]
    pub planned_commands: Vec<String>,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    /// Bumped on every handoff; the ceiling stops restart loops.
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

const fn default_max_restarts() -> u32 {
    2
}

fn truncate_owned(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...(truncated)", &text[..end])
}

impl RemediationContext {
    /// Serialize with size caps applied. If even the capped form fails to
    /// serialize, a minimal safe subset is stored instead.
    #[must_use]
    pub fn to_capped_json(&self) -> Value {
        let mut capped = self.clone();
        capped.commands_executed.truncate(MAX_CONTEXT_COMMANDS);
        capped.command_outputs.truncate(MAX_CONTEXT_COMMANDS);
        capped.command_outputs = capped
            .command_outputs
            .iter()
            .map(|o| truncate_owned(o, MAX_OUTPUT_LEN))
            .collect();
        capped.ai_analysis = capped
            .ai_analysis
            .as_deref()
            .map(|a| truncate_owned(a, MAX_ANALYSIS_LEN));
        capped.ai_reasoning = capped
            .ai_reasoning
            .as_deref()
            .map(|r| truncate_owned(r, MAX_ANALYSIS_LEN));
        capped.planned_commands.truncate(MAX_PLANNED_COMMANDS);

        match serde_json::to_value(&capped) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, alert_name = %self.alert_name, "Context serialization fallback");
                json!({
                    "alert_name": self.alert_name,
                    "alert_instance": self.alert_instance,
                    "alert_fingerprint": self.alert_fingerprint,
                    "severity": self.severity,
                    "attempt_number": self.attempt_number,
                    "target_host": self.target_host,
                    "restart_count": self.restart_count,
                    "max_restarts": self.max_restarts,
                    "error": format!("Context too large or complex to serialize: {e}"),
                })
            }
        }
    }

    /// Deserialize a stored context; unknown fields are ignored, missing
    /// ones defaulted, so old rows keep loading across versions.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            warn!(error = %e, "Stored remediation context malformed, using defaults");
            Self::default()
        })
    }
}

/// Outcome of initiating a self-restart.
#[derive(Debug, Clone, Serialize)]
pub struct HandoffInitiated {
    pub handoff_id: String,
    pub status: String,
}

/// Manages self-restart handoffs.
pub struct PreservationManager {
    store: Arc<Store>,
    orchestrator: Option<Arc<WorkflowClient>>,
    notifier: Arc<Notifier>,
    /// Base URL the orchestrator uses to reach warden back
    callback_base_url: String,
}

impl PreservationManager {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        orchestrator: Option<Arc<WorkflowClient>>,
        notifier: Arc<Notifier>,
        callback_base_url: String,
    ) -> Self {
        Self {
            store,
            orchestrator,
            notifier,
            callback_base_url,
        }
    }

    /// Initiate a self-restart via orchestrator handoff.
    ///
    /// Fails when another handoff is still non-terminal or the context has
    /// exhausted its restart budget.
    pub async fn initiate_self_restart(
        &self,
        target: RestartTarget,
        reason: &str,
        mut context: Option<RemediationContext>,
        timeout_minutes: u32,
    ) -> EngineResult<HandoffInitiated> {
        if let Some(ctx) = &context {
            if ctx.restart_count >= ctx.max_restarts {
                warn!(
                    alert_name = %ctx.alert_name,
                    restart_count = ctx.restart_count,
                    max_restarts = ctx.max_restarts,
                    "Restart budget exhausted"
                );
                return Err(EngineError::Capacity(format!(
                    "maximum restart count ({}) reached for this remediation",
                    ctx.max_restarts
                )));
            }
        }

        if let Some(ctx) = &mut context {
            ctx.restart_count += 1;
        }

        let handoff_id = format!("sp-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let callback_url = format!("{}/resume", self.callback_base_url);
        let context_json = context.as_ref().map(RemediationContext::to_capped_json);

        // Advisory lock + existence check + insert in one transaction: two
        // concurrent initiators serialize here and the loser sees the
        // winner's row.
        {
            let mut tx = self.store.pool().begin().await?;

            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(HANDOFF_LOCK_KEY)
                .execute(&mut *tx)
                .await?;

            let existing = sqlx::query(
                r"
                SELECT handoff_id, status
                FROM self_preservation_handoffs
                WHERE status IN ('pending', 'in_progress')
                LIMIT 1
                ",
            )
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                let existing_id: String = row.try_get("handoff_id")?;
                let existing_status: String = row.try_get("status")?;
                return Err(EngineError::Invariant(format!(
                    "existing handoff {existing_id} is still active (status: {existing_status})"
                )));
            }

            sqlx::query(
                r"
                INSERT INTO self_preservation_handoffs (
                    handoff_id, restart_target, restart_reason,
                    remediation_context, status, callback_url
                ) VALUES ($1, $2, $3, $4, 'pending', $5)
                ",
            )
            .bind(&handoff_id)
            .bind(target.as_str())
            .bind(reason)
            .bind(&context_json)
            .bind(&callback_url)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
        }

        info!(
            handoff_id = %handoff_id,
            target = target.as_str(),
            reason,
            has_context = context.is_some(),
            "Self-restart initiated"
        );

        self.notifier.notify(NotifyEvent::SelfRestartInitiated {
            handoff_id: handoff_id.clone(),
            target: target.as_str().to_string(),
            reason: reason.to_string(),
            resumes_remediation: context.is_some(),
            timestamp: Utc::now(),
        });

        // Hand the restart to the orchestrator. Without one the row stays
        // pending and the restart has to happen manually.
        let Some(orchestrator) = &self.orchestrator else {
            warn!(
                handoff_id = %handoff_id,
                "Orchestrator not configured - handoff saved, restart must be manual"
            );
            return Ok(HandoffInitiated {
                handoff_id,
                status: "pending".to_string(),
            });
        };

        let payload = json!({
            "handoff_id": handoff_id,
            "restart_target": target.as_str(),
            "restart_command": target.restart_command(),
            "restart_reason": reason,
            "callback_url": callback_url,
            "health_url": format!("{}/health", self.callback_base_url),
            "timeout_minutes": timeout_minutes,
        });

        match orchestrator.trigger_webhook(SELF_RESTART_WEBHOOK, &payload).await {
            Ok(response) => {
                let execution_id = response
                    .get("execution_id")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                self.store
                    .update_handoff(
                        &handoff_id,
                        "in_progress",
                        execution_id.as_deref(),
                        None,
                        None,
                    )
                    .await?;

                Ok(HandoffInitiated {
                    handoff_id,
                    status: "in_progress".to_string(),
                })
            }
            Err(e) => {
                self.store
                    .update_handoff(
                        &handoff_id,
                        "failed",
                        None,
                        Some(&format!("orchestrator trigger failed: {e}")),
                        Some(Utc::now()),
                    )
                    .await?;
                Err(EngineError::Transient(format!(
                    "orchestrator workflow trigger failed: {e}"
                )))
            }
        }
    }

    /// Complete a handoff after the orchestrator's `/resume` callback.
    ///
    /// Returns the saved remediation context so the pipeline can continue.
    pub async fn resume_from_handoff(
        &self,
        handoff_id: &str,
    ) -> EngineResult<Option<RemediationContext>> {
        info!(handoff_id, "Resuming from handoff");

        let Some(handoff) = self.store.load_handoff(handoff_id).await? else {
            return Err(EngineError::Validation(format!(
                "handoff {handoff_id} not found"
            )));
        };

        if handoff.status != "pending" && handoff.status != "in_progress" {
            return Err(EngineError::Validation(format!(
                "handoff {handoff_id} is in status {}, cannot resume",
                handoff.status
            )));
        }

        let completed_at = Utc::now();
        self.store
            .update_handoff(handoff_id, "completed", None, None, Some(completed_at))
            .await?;

        let duration = Some((completed_at - handoff.created_at).num_seconds());
        self.notifier.notify(NotifyEvent::SelfRestartCompleted {
            handoff_id: handoff_id.to_string(),
            target: handoff.restart_target.clone(),
            duration_secs: duration,
            timestamp: completed_at,
        });

        let context = handoff
            .remediation_context
            .as_ref()
            .map(RemediationContext::from_json);

        info!(
            handoff_id,
            had_context = context.is_some(),
            "Handoff resumed"
        );
        Ok(context)
    }

    /// Startup recovery: time out stale handoffs, then return the active one
    /// (from a restart that just completed) if present.
    pub async fn startup_recovery(&self, stale_after_minutes: i64) -> Option<HandoffRow> {
        match self.store.cleanup_stale_handoffs(stale_after_minutes).await {
            Ok(0) => {}
            Ok(count) => info!(cleaned = count, "Stale handoffs cleaned up"),
            Err(e) => warn!(error = %e, "Stale handoff cleanup failed"),
        }

        match self.store.load_active_handoff().await {
            Ok(Some(handoff)) => {
                info!(
                    handoff_id = %handoff.handoff_id,
                    target = %handoff.restart_target,
                    "Active handoff found on startup"
                );
                Some(handoff)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Active handoff check failed");
                None
            }
        }
    }

    /// Cancel an active handoff.
    pub async fn cancel_handoff(&self, handoff_id: &str, reason: &str) -> EngineResult<()> {
        let Some(handoff) = self.store.load_handoff(handoff_id).await? else {
            return Err(EngineError::Validation(format!(
                "handoff {handoff_id} not found"
            )));
        };

        if matches!(
            handoff.status.as_str(),
            "completed" | "failed" | "timeout" | "cancelled"
        ) {
            return Err(EngineError::Validation(format!(
                "handoff already in terminal state: {}",
                handoff.status
            )));
        }

        self.store
            .update_handoff(handoff_id, "cancelled", None, Some(reason), Some(Utc::now()))
            .await?;

        info!(handoff_id, reason, "Handoff cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_context() -> RemediationContext {
        RemediationContext {
            alert_name: "DiskSpaceCritical".to_string(),
            alert_instance: "keep:9100".to_string(),
            alert_fingerprint: "fp".to_string(),
            severity: "critical".to_string(),
            attempt_number: 2,
            commands_executed: (0..80).map(|i| format!("cmd-{i}")).collect(),
            command_outputs: (0..80).map(|_| "x".repeat(50_000)).collect(),
            ai_analysis: Some("a".repeat(60_000)),
            ai_reasoning: Some("r".repeat(60_000)),
            planned_commands: (0..40).map(|i| format!("plan-{i}")).collect(),
            target_host: "keep".to_string(),
            service_name: None,
            started_at: None,
            restart_count: 0,
            max_restarts: 2,
        }
    }

    #[test]
    fn test_context_caps_applied() {
        let value = big_context().to_capped_json();

        let commands = value["commands_executed"].as_array().unwrap();
        assert_eq!(commands.len(), MAX_CONTEXT_COMMANDS);

        let outputs = value["command_outputs"].as_array().unwrap();
        assert_eq!(outputs.len(), MAX_CONTEXT_COMMANDS);
        for output in outputs {
            assert!(output.as_str().unwrap().len() <= MAX_OUTPUT_LEN + 20);
        }

        let analysis = value["ai_analysis"].as_str().unwrap();
        assert!(analysis.len() <= MAX_ANALYSIS_LEN + 20);

        let planned = value["planned_commands"].as_array().unwrap();
        assert_eq!(planned.len(), MAX_PLANNED_COMMANDS);
    }

    #[test]
    fn test_context_round_trip() {
        let value = big_context().to_capped_json();
        let restored = RemediationContext::from_json(&value);

        assert_eq!(restored.alert_name, "DiskSpaceCritical");
        assert_eq!(restored.attempt_number, 2);
        assert_eq!(restored.commands_executed.len(), MAX_CONTEXT_COMMANDS);
        assert_eq!(restored.max_restarts, 2);
    }

    #[test]
    fn test_malformed_context_defaults() {
        let restored = RemediationContext::from_json(&json!({"attempt_number": "not-a-number"}));
        assert_eq!(restored.alert_name, "");
        assert_eq!(restored.restart_count, 0);
    }

    #[test]
    fn test_restart_target_commands() {
        assert_eq!(RestartTarget::Engine.restart_command(), "docker restart warden");
        assert!(RestartTarget::EngineDb
            .restart_command()
            .contains("postgres-warden"));
        assert_eq!(
            RestartTarget::DockerDaemon.restart_command(),
            "sudo systemctl restart docker"
        );
        assert_eq!(RestartTarget::parse("engine_db"), Some(RestartTarget::EngineDb));
        assert_eq!(RestartTarget::parse("mainframe"), None);
    }
}
