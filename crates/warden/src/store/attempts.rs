//! Remediation attempt log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::info;

use super::Store;
use crate::error::{EngineError, EngineResult};
use crate::validator::RiskLevel;

/// One remediation attempt, as written to `remediation_log`.
///
/// `commands_executed`, `command_outputs`, and `exit_codes` are parallel
/// arrays; [`RemediationAttempt::validate_arrays`] enforces equal lengths
/// before any insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAttempt {
    pub alert_name: String,
    pub alert_instance: String,
    pub alert_fingerprint: String,
    pub severity: String,
    pub attempt_number: i32,
    pub ai_analysis: Option<String>,
    pub ai_reasoning: Option<String>,
    pub remediation_plan: Option<String>,
    pub commands_executed: Vec<String>,
    pub command_outputs: Vec<String>,
    pub exit_codes: Vec<i32>,
    pub success: bool,
    pub error_message: Option<String>,
    pub execution_duration_seconds: Option<i32>,
    pub risk_level: Option<RiskLevel>,
    pub escalated: bool,
    pub user_approved: Option<bool>,
    pub discord_message_id: Option<String>,
    pub discord_thread_id: Option<String>,
}

impl RemediationAttempt {
    /// A minimal attempt shell for the common constructor paths.
    #[must_use]
    pub fn new(
        alert_name: &str,
        alert_instance: &str,
        alert_fingerprint: &str,
        severity: &str,
        attempt_number: i32,
    ) -> Self {
        Self {
            alert_name: alert_name.to_string(),
            alert_instance: alert_instance.to_string(),
            alert_fingerprint: alert_fingerprint.to_string(),
            severity: severity.to_string(),
            attempt_number,
            ai_analysis: None,
            ai_reasoning: None,
            remediation_plan: None,
            commands_executed: vec![],
            command_outputs: vec![],
            exit_codes: vec![],
            success: false,
            error_message: None,
            execution_duration_seconds: None,
            risk_level: None,
            escalated: false,
            user_approved: None,
            discord_message_id: None,
            discord_thread_id: None,
        }
    }

    /// Whether this row is an escalation-only marker (escalated, nothing
    /// executed). Markers never count toward the attempt counter.
    #[must_use]
    pub fn is_escalation_marker(&self) -> bool {
        self.escalated && self.commands_executed.is_empty()
    }

    /// Enforce the parallel-array invariant.
    pub fn validate_arrays(&self) -> EngineResult<()> {
        if self.commands_executed.len() == self.command_outputs.len()
            && self.command_outputs.len() == self.exit_codes.len()
        {
            Ok(())
        } else {
            Err(EngineError::Invariant(format!(
                "parallel array length mismatch: {} commands, {} outputs, {} exit codes",
                self.commands_executed.len(),
                self.command_outputs.len(),
                self.exit_codes.len()
            )))
        }
    }
}

/// A read-back attempt row (escalation context, analytics).
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub attempt_number: i32,
    pub ai_analysis: Option<String>,
    pub ai_reasoning: Option<String>,
    pub commands_executed: Vec<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub execution_duration_seconds: Option<i32>,
}

/// Aggregate remediation outcomes over a window.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationStats {
    pub total_attempts: i64,
    pub successful: i64,
    pub escalated: i64,
    pub avg_duration: Option<f64>,
    pub unique_alerts: i64,
    pub success_rate: f64,
}

impl Store {
    /// Log a remediation attempt. Returns the inserted row id.
    pub async fn log_attempt(&self, attempt: &RemediationAttempt) -> EngineResult<i64> {
        attempt.validate_arrays()?;

        let row = sqlx::query(
            r"
            INSERT INTO remediation_log (
                alert_name, alert_instance, alert_fingerprint, severity,
                attempt_number, ai_analysis, ai_reasoning, remediation_plan,
                commands_executed, command_outputs, exit_codes,
                success, error_message, execution_duration_seconds,
                risk_level, escalated, user_approved,
                discord_message_id, discord_thread_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                      $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING id
            ",
        )
        .bind(&attempt.alert_name)
        .bind(&attempt.alert_instance)
        .bind(&attempt.alert_fingerprint)
        .bind(&attempt.severity)
        .bind(attempt.attempt_number)
        .bind(attempt.ai_analysis.as_deref())
        .bind(attempt.ai_reasoning.as_deref())
        .bind(attempt.remediation_plan.as_deref())
        .bind(&attempt.commands_executed)
        .bind(&attempt.command_outputs)
        .bind(&attempt.exit_codes)
        .bind(attempt.success)
        .bind(attempt.error_message.as_deref())
        .bind(attempt.execution_duration_seconds)
        .bind(attempt.risk_level.map(|r| r.as_str()))
        .bind(attempt.escalated)
        .bind(attempt.user_approved)
        .bind(attempt.discord_message_id.as_deref())
        .bind(attempt.discord_thread_id.as_deref())
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        info!(
            record_id = id,
            alert_name = %attempt.alert_name,
            success = attempt.success,
            escalated = attempt.escalated,
            "Remediation attempt logged"
        );
        Ok(id)
    }

    /// Count remediation attempts for an identity within the window.
    ///
    /// Escalation-only markers are excluded, otherwise every escalation would
    /// bump the counter and re-trigger escalation forever. The predicate is
    /// NULL-safe: a NULL array counts as no commands.
    pub async fn get_attempt_count(
        &self,
        alert_name: &str,
        alert_instance: &str,
        window_hours: i64,
    ) -> EngineResult<i64> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) AS n
            FROM remediation_log
            WHERE alert_name = $1
              AND alert_instance = $2
              AND timestamp > NOW() - ($3 * INTERVAL '1 hour')
              AND NOT (escalated = TRUE AND COALESCE(array_length(commands_executed, 1), 0) = 0)
            ",
        )
        .bind(alert_name)
        .bind(alert_instance)
        .bind(window_hours)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("n")?;
        Ok(count)
    }

    /// Get the most recent attempts for an identity (escalation context).
    pub async fn get_recent_attempts(
        &self,
        alert_name: &str,
        alert_instance: &str,
        limit: i64,
    ) -> EngineResult<Vec<AttemptRow>> {
        let rows = sqlx::query(
            r"
            SELECT id, timestamp, attempt_number, ai_analysis, ai_reasoning,
                   commands_executed, success, error_message, execution_duration_seconds
            FROM remediation_log
            WHERE alert_name = $1
              AND alert_instance = $2
            ORDER BY timestamp DESC
            LIMIT $3
            ",
        )
        .bind(alert_name)
        .bind(alert_instance)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(AttemptRow {
                    id: row.try_get("id")?,
                    timestamp: row.try_get("timestamp")?,
                    attempt_number: row.try_get("attempt_number")?,
                    ai_analysis: row.try_get("ai_analysis")?,
                    ai_reasoning: row.try_get("ai_reasoning")?,
                    commands_executed: row
                        .try_get::<Option<Vec<String>>, _>("commands_executed")?
                        .unwrap_or_default(),
                    success: row.try_get("success")?,
                    error_message: row.try_get("error_message")?,
                    execution_duration_seconds: row.try_get("execution_duration_seconds")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(EngineError::from)
    }

    /// Delete attempts younger than 24 hours for an identity.
    ///
    /// Called on alert resolution to reset the counter. Returns the number
    /// of deleted rows.
    pub async fn clear_attempts(
        &self,
        alert_name: &str,
        alert_instance: &str,
    ) -> EngineResult<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM remediation_log
            WHERE alert_name = $1
              AND alert_instance = $2
              AND timestamp > NOW() - INTERVAL '24 hours'
            ",
        )
        .bind(alert_name)
        .bind(alert_instance)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        info!(
            alert_name,
            alert_instance,
            count,
            "Attempts cleared on resolution"
        );
        Ok(count)
    }

    /// Recent alert names/instances for the correlation window.
    pub async fn get_recent_alert_identities(
        &self,
        window_seconds: i64,
    ) -> EngineResult<Vec<(String, String, DateTime<Utc>)>> {
        let rows = sqlx::query(
            r"
            SELECT alert_name, alert_instance, timestamp
            FROM remediation_log
            WHERE timestamp > NOW() - ($1 * INTERVAL '1 second')
            ORDER BY timestamp DESC
            ",
        )
        .bind(window_seconds)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get("alert_name")?,
                    row.try_get("alert_instance")?,
                    row.try_get("timestamp")?,
                ))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(EngineError::from)
    }

    /// Aggregate remediation statistics over the last `days` days.
    pub async fn get_statistics(&self, days: i64) -> EngineResult<RemediationStats> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) AS total_attempts,
                COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(SUM(CASE WHEN escalated THEN 1 ELSE 0 END), 0) AS escalated,
                AVG(execution_duration_seconds)::float8 AS avg_duration,
                COUNT(DISTINCT alert_name) AS unique_alerts
            FROM remediation_log
            WHERE timestamp > NOW() - ($1 * INTERVAL '1 day')
            ",
        )
        .bind(days)
        .fetch_one(&self.pool)
        .await?;

        let total_attempts: i64 = row.try_get("total_attempts")?;
        let successful: i64 = row.try_get("successful")?;

        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total_attempts > 0 {
            successful as f64 / total_attempts as f64 * 100.0
        } else {
            0.0
        };

        Ok(RemediationStats {
            total_attempts,
            successful,
            escalated: row.try_get("escalated")?,
            avg_duration: row.try_get("avg_duration")?,
            unique_alerts: row.try_get("unique_alerts")?,
            success_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_marker_predicate() {
        let mut attempt = RemediationAttempt::new("X", "i", "fp", "warning", 1);
        assert!(!attempt.is_escalation_marker());

        attempt.escalated = true;
        assert!(attempt.is_escalation_marker());

        attempt.commands_executed = vec!["docker restart caddy".to_string()];
        assert!(!attempt.is_escalation_marker());
    }

    #[test]
    fn test_parallel_array_invariant() {
        let mut attempt = RemediationAttempt::new("X", "i", "fp", "warning", 1);
        assert!(attempt.validate_arrays().is_ok());

        attempt.commands_executed = vec!["a".into(), "b".into()];
        attempt.command_outputs = vec!["out-a".into(), "out-b".into()];
        attempt.exit_codes = vec![0, 0];
        assert!(attempt.validate_arrays().is_ok());

        attempt.exit_codes.pop();
        let err = attempt.validate_arrays().unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }
}
