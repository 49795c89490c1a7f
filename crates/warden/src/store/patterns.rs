//! Learned remediation patterns and failure patterns.
//!
//! The learning engine owns the semantics (fingerprints, similarity,
//! thresholds); this module owns the rows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use tracing::info;

use super::Store;
use crate::error::{EngineError, EngineResult};

/// A learned `(alert_name, symptom_fingerprint) -> commands` mapping with
/// confidence statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Pattern {
    pub id: i64,
    pub alert_name: String,
    pub alert_category: String,
    pub symptom_fingerprint: String,
    pub root_cause: Option<String>,
    pub solution_commands: Vec<String>,
    pub success_count: i32,
    pub failure_count: i32,
    pub confidence_score: f64,
    pub risk_level: String,
    pub usage_count: i32,
    pub avg_execution_time: Option<f64>,
    pub target_host: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// A recorded failed remediation shape, keyed by its signature.
#[derive(Debug, Clone, Serialize)]
pub struct FailurePattern {
    pub pattern_signature: String,
    pub alert_name: String,
    pub commands_attempted: Vec<String>,
    pub failure_reason: String,
    pub failure_count: i32,
    pub last_failed_at: DateTime<Utc>,
}

const PATTERN_COLUMNS: &str = r"
    id, alert_name, alert_category, symptom_fingerprint, root_cause,
    solution_commands, success_count, failure_count, confidence_score,
    risk_level, usage_count, avg_execution_time, target_host, enabled,
    created_at, updated_at, last_used_at
";

fn pattern_from_row(row: &sqlx::postgres::PgRow) -> Result<Pattern, sqlx::Error> {
    Ok(Pattern {
        id: row.try_get("id")?,
        alert_name: row.try_get("alert_name")?,
        alert_category: row.try_get("alert_category")?,
        symptom_fingerprint: row.try_get("symptom_fingerprint")?,
        root_cause: row.try_get("root_cause")?,
        solution_commands: row
            .try_get::<Option<Vec<String>>, _>("solution_commands")?
            .unwrap_or_default(),
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        confidence_score: row.try_get("confidence_score")?,
        risk_level: row.try_get("risk_level")?,
        usage_count: row.try_get("usage_count")?,
        avg_execution_time: row.try_get("avg_execution_time")?,
        target_host: row.try_get("target_host")?,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

impl Store {
    /// All enabled patterns, best first. Feeds the learning engine's cache.
    pub async fn load_enabled_patterns(&self) -> EngineResult<Vec<Pattern>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {PATTERN_COLUMNS}
            FROM remediation_patterns
            WHERE enabled = TRUE
            ORDER BY confidence_score DESC, usage_count DESC
            "
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(pattern_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::from)
    }

    /// One pattern by id.
    pub async fn get_pattern(&self, id: i64) -> EngineResult<Option<Pattern>> {
        let row = sqlx::query(&format!(
            r"
            SELECT {PATTERN_COLUMNS}
            FROM remediation_patterns
            WHERE id = $1
            "
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| pattern_from_row(&r))
            .transpose()
            .map_err(EngineError::from)
    }

    /// The pattern with an exact `(alert_name, symptom_fingerprint)` key.
    pub async fn find_pattern_by_fingerprint(
        &self,
        alert_name: &str,
        symptom_fingerprint: &str,
    ) -> EngineResult<Option<Pattern>> {
        let row = sqlx::query(&format!(
            r"
            SELECT {PATTERN_COLUMNS}
            FROM remediation_patterns
            WHERE alert_name = $1
              AND symptom_fingerprint = $2
            LIMIT 1
            "
        ))
        .bind(alert_name)
        .bind(symptom_fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| pattern_from_row(&r))
            .transpose()
            .map_err(EngineError::from)
    }

    /// Insert a new pattern extracted from a verified successful remediation.
    pub async fn create_pattern(
        &self,
        alert_name: &str,
        category: &str,
        symptom_fingerprint: &str,
        root_cause: Option<&str>,
        solution_commands: &[String],
        risk_level: &str,
        target_host: Option<&str>,
    ) -> EngineResult<i64> {
        let row = sqlx::query(
            r"
            INSERT INTO remediation_patterns (
                alert_name, alert_category, symptom_fingerprint, root_cause,
                solution_commands, risk_level, target_host
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(alert_name)
        .bind(category)
        .bind(symptom_fingerprint)
        .bind(root_cause)
        .bind(solution_commands)
        .bind(risk_level)
        .bind(target_host)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        info!(pattern_id = id, alert_name, "Pattern created");
        Ok(id)
    }

    /// Apply an outcome to a pattern: bump success/failure, recompute the
    /// Laplace-smoothed confidence `(success+1)/(success+failure+1)`, fold
    /// the execution time into the running average, and refresh usage stats.
    ///
    /// `replace_commands` swaps in a fresh command list (used when a verified
    /// success re-derives the solution).
    pub async fn record_pattern_outcome(
        &self,
        pattern_id: i64,
        success: bool,
        execution_time_secs: i32,
        replace_commands: Option<&[String]>,
    ) -> EngineResult<f64> {
        let row = sqlx::query(
            r"
            UPDATE remediation_patterns
            SET
                success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                failure_count = failure_count + CASE WHEN NOT $2 THEN 1 ELSE 0 END,
                confidence_score = (
                    success_count::float + CASE WHEN $2 THEN 1 ELSE 0 END
                ) / (
                    success_count + failure_count + 1
                ),
                avg_execution_time = (
                    COALESCE(avg_execution_time, 0) * usage_count + $3
                ) / (usage_count + 1),
                solution_commands = COALESCE($4, solution_commands),
                usage_count = usage_count + 1,
                last_used_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING confidence_score
            ",
        )
        .bind(pattern_id)
        .bind(success)
        .bind(execution_time_secs)
        .bind(replace_commands)
        .fetch_one(&self.pool)
        .await?;

        let confidence: f64 = row.try_get("confidence_score")?;
        info!(pattern_id, success, new_confidence = confidence, "Pattern outcome recorded");
        Ok(confidence)
    }

    /// Upsert a failure pattern, bumping its counter on conflict.
    pub async fn record_failure_pattern(
        &self,
        pattern_signature: &str,
        alert_name: &str,
        alert_instance: &str,
        symptom_fingerprint: Option<&str>,
        commands_attempted: &[String],
        failure_reason: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            r"
            INSERT INTO remediation_failures (
                pattern_signature, alert_name, alert_instance, symptom_fingerprint,
                commands_attempted, failure_reason, failure_count, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 1, NOW())
            ON CONFLICT (pattern_signature) DO UPDATE SET
                failure_count = remediation_failures.failure_count + 1,
                last_failed_at = NOW(),
                failure_reason = EXCLUDED.failure_reason
            ",
        )
        .bind(pattern_signature)
        .bind(alert_name)
        .bind(alert_instance)
        .bind(symptom_fingerprint)
        .bind(commands_attempted)
        .bind(failure_reason)
        .execute(&self.pool)
        .await?;

        info!(
            alert_name,
            signature = &pattern_signature[..pattern_signature.len().min(16)],
            "Failure pattern recorded"
        );
        Ok(())
    }

    /// Failure patterns for an alert, worst first.
    pub async fn get_failure_patterns(
        &self,
        alert_name: &str,
        limit: i64,
    ) -> EngineResult<Vec<FailurePattern>> {
        let rows = sqlx::query(
            r"
            SELECT pattern_signature, alert_name, commands_attempted, failure_reason,
                   failure_count, last_failed_at
            FROM remediation_failures
            WHERE alert_name = $1
            ORDER BY failure_count DESC, last_failed_at DESC
            LIMIT $2
            ",
        )
        .bind(alert_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(FailurePattern {
                    pattern_signature: row.try_get("pattern_signature")?,
                    alert_name: row.try_get("alert_name")?,
                    commands_attempted: row
                        .try_get::<Option<Vec<String>>, _>("commands_attempted")?
                        .unwrap_or_default(),
                    failure_reason: row.try_get("failure_reason")?,
                    failure_count: row.try_get("failure_count")?,
                    last_failed_at: row.try_get("last_failed_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(EngineError::from)
    }

    /// Look up one failure pattern by signature with at least `min_failures`.
    pub async fn find_failure_pattern(
        &self,
        pattern_signature: &str,
        min_failures: i32,
    ) -> EngineResult<Option<(i32, String)>> {
        let row = sqlx::query(
            r"
            SELECT failure_count, failure_reason
            FROM remediation_failures
            WHERE pattern_signature = $1
              AND failure_count >= $2
            ",
        )
        .bind(pattern_signature)
        .bind(min_failures)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok::<_, sqlx::Error>((r.try_get("failure_count")?, r.try_get("failure_reason")?))
        })
        .transpose()
        .map_err(EngineError::from)
    }

    /// Aggregate pattern statistics for `/analytics`.
    pub async fn pattern_stats(&self) -> EngineResult<PatternStats> {
        let row = sqlx::query(
            r"
            SELECT
                COUNT(*) AS total_patterns,
                COUNT(*) FILTER (WHERE confidence_score >= 0.75) AS high_confidence,
                COUNT(*) FILTER (WHERE confidence_score >= 0.50 AND confidence_score < 0.75)
                    AS medium_confidence,
                AVG(confidence_score) AS avg_confidence,
                COALESCE(SUM(usage_count), 0) AS total_usage,
                COALESCE(SUM(success_count), 0) AS total_successes,
                COALESCE(SUM(failure_count), 0) AS total_failures
            FROM remediation_patterns
            WHERE enabled = TRUE
            ",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PatternStats {
            total_patterns: row.try_get("total_patterns")?,
            high_confidence: row.try_get("high_confidence")?,
            medium_confidence: row.try_get("medium_confidence")?,
            avg_confidence: row.try_get("avg_confidence")?,
            total_usage: row.try_get("total_usage")?,
            total_successes: row.try_get("total_successes")?,
            total_failures: row.try_get("total_failures")?,
        })
    }
}

/// Aggregate learning statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PatternStats {
    pub total_patterns: i64,
    pub high_confidence: i64,
    pub medium_confidence: i64,
    pub avg_confidence: Option<f64>,
    pub total_usage: i64,
    pub total_successes: i64,
    pub total_failures: i64,
}
