//! Self-preservation handoff rows.
//!
//! The preservation manager owns the protocol (advisory lock, single active
//! handoff); this module owns row access. Handoff creation happens inside
//! the manager's transaction, so the insert helper takes an executor rather
//! than the pool.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use tracing::warn;

use super::Store;
use crate::error::{EngineError, EngineResult};

/// A persisted handoff row.
#[derive(Debug, Clone, Serialize)]
pub struct HandoffRow {
    pub handoff_id: String,
    pub restart_target: String,
    pub restart_reason: String,
    pub remediation_context: Option<serde_json::Value>,
    pub status: String,
    pub callback_url: String,
    pub orchestrator_execution_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn handoff_from_row(row: &sqlx::postgres::PgRow) -> Result<HandoffRow, sqlx::Error> {
    Ok(HandoffRow {
        handoff_id: row.try_get("handoff_id")?,
        restart_target: row.try_get("restart_target")?,
        restart_reason: row.try_get("restart_reason")?,
        remediation_context: row.try_get("remediation_context")?,
        status: row.try_get("status")?,
        callback_url: row.try_get("callback_url")?,
        orchestrator_execution_id: row.try_get("orchestrator_execution_id")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

const HANDOFF_COLUMNS: &str = r"
    handoff_id, restart_target, restart_reason, remediation_context, status,
    callback_url, orchestrator_execution_id, error_message, created_at, completed_at
";

impl Store {
    /// Load one handoff by id.
    pub async fn load_handoff(&self, handoff_id: &str) -> EngineResult<Option<HandoffRow>> {
        let row = sqlx::query(&format!(
            r"
            SELECT {HANDOFF_COLUMNS}
            FROM self_preservation_handoffs
            WHERE handoff_id = $1
            "
        ))
        .bind(handoff_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| handoff_from_row(&r))
            .transpose()
            .map_err(EngineError::from)
    }

    /// The most recent non-terminal handoff, if any.
    pub async fn load_active_handoff(&self) -> EngineResult<Option<HandoffRow>> {
        let row = sqlx::query(&format!(
            r"
            SELECT {HANDOFF_COLUMNS}
            FROM self_preservation_handoffs
            WHERE status IN ('pending', 'in_progress')
            ORDER BY created_at DESC
            LIMIT 1
            "
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| handoff_from_row(&r))
            .transpose()
            .map_err(EngineError::from)
    }

    /// Update a handoff's mutable fields (status transitions).
    pub async fn update_handoff(
        &self,
        handoff_id: &str,
        status: &str,
        orchestrator_execution_id: Option<&str>,
        error_message: Option<&str>,
        completed_at: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        sqlx::query(
            r"
            UPDATE self_preservation_handoffs
            SET status = $2,
                orchestrator_execution_id = COALESCE($3, orchestrator_execution_id),
                error_message = $4,
                completed_at = $5
            WHERE handoff_id = $1
            ",
        )
        .bind(handoff_id)
        .bind(status)
        .bind(orchestrator_execution_id)
        .bind(error_message)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Time out stale non-terminal handoffs in batches of 100.
    ///
    /// Called on startup so an orphaned `in_progress` row (orchestrator died,
    /// callback never arrived) cannot block self-restart forever. The batch
    /// bound keeps the startup query cheap even after long outages.
    pub async fn cleanup_stale_handoffs(&self, max_age_minutes: i64) -> EngineResult<u64> {
        let mut total: u64 = 0;

        loop {
            let rows = sqlx::query(
                r"
                UPDATE self_preservation_handoffs
                SET status = 'timeout',
                    error_message = 'Cleanup: no callback received within timeout',
                    completed_at = NOW()
                WHERE handoff_id IN (
                    SELECT handoff_id
                    FROM self_preservation_handoffs
                    WHERE status IN ('pending', 'in_progress')
                      AND created_at < NOW() - ($1 * INTERVAL '1 minute')
                    LIMIT 100
                )
                RETURNING handoff_id, restart_target, created_at
                ",
            )
            .bind(max_age_minutes)
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let id: String = row.try_get("handoff_id")?;
                let target: String = row.try_get("restart_target")?;
                warn!(handoff_id = %id, target = %target, "Stale handoff timed out");
            }

            let batch = rows.len() as u64;
            total += batch;
            if batch < 100 {
                break;
            }
        }

        Ok(total)
    }
}
