//! Maintenance window persistence.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use tracing::info;

use super::Store;
use crate::error::{EngineError, EngineResult};

/// A maintenance window row.
///
/// `host = NULL` means global: the window matches every host. Active iff
/// `is_active AND ended_at IS NULL`.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceWindow {
    pub id: i64,
    pub host: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub reason: String,
    pub created_by: String,
    pub suppressed_alert_count: i32,
}

fn window_from_row(row: &sqlx::postgres::PgRow) -> Result<MaintenanceWindow, sqlx::Error> {
    Ok(MaintenanceWindow {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        is_active: row.try_get("is_active")?,
        reason: row.try_get("reason")?,
        created_by: row.try_get("created_by")?,
        suppressed_alert_count: row.try_get("suppressed_alert_count")?,
    })
}

impl Store {
    /// Whether any maintenance window is currently active.
    pub async fn is_maintenance_mode(&self) -> EngineResult<bool> {
        let row = sqlx::query(
            r"
            SELECT COUNT(*) > 0 AS active
            FROM maintenance_windows
            WHERE is_active = TRUE AND ended_at IS NULL
            ",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("active")?)
    }

    /// The active maintenance window matching a host, if any.
    ///
    /// A global window (`host IS NULL`) matches every host; a host-specific
    /// window wins over a global one for reporting (`NULLS FIRST` keeps the
    /// original tie-break: global windows sort first). Host matching is
    /// case-insensitive.
    pub async fn active_maintenance_window(
        &self,
        host: &str,
    ) -> EngineResult<Option<MaintenanceWindow>> {
        let row = sqlx::query(
            r"
            SELECT id, host, started_at, ended_at, is_active, reason, created_by,
                   suppressed_alert_count
            FROM maintenance_windows
            WHERE is_active = TRUE
              AND ended_at IS NULL
              AND (LOWER(host) = LOWER($1) OR host IS NULL)
            ORDER BY host NULLS FIRST
            LIMIT 1
            ",
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| window_from_row(&r))
            .transpose()
            .map_err(EngineError::from)
    }

    /// Bump the suppressed-alert counter on a window.
    pub async fn increment_maintenance_suppression(&self, window_id: i64) -> EngineResult<()> {
        sqlx::query(
            r"
            UPDATE maintenance_windows
            SET suppressed_alert_count = suppressed_alert_count + 1
            WHERE id = $1
            ",
        )
        .bind(window_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Open a maintenance window. Returns the existing active window instead
    /// when one already covers the requested scope, so at most one active
    /// window exists per host by construction.
    pub async fn start_maintenance_window(
        &self,
        host: Option<&str>,
        reason: &str,
        created_by: &str,
    ) -> EngineResult<(MaintenanceWindow, bool)> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r"
            SELECT id, host, started_at, ended_at, is_active, reason, created_by,
                   suppressed_alert_count
            FROM maintenance_windows
            WHERE is_active = TRUE
              AND ended_at IS NULL
              AND (host = $1 OR host IS NULL OR $1 IS NULL)
            LIMIT 1
            FOR UPDATE
            ",
        )
        .bind(host)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let window = window_from_row(&row)?;
            tx.rollback().await?;
            return Ok((window, false));
        }

        let row = sqlx::query(
            r"
            INSERT INTO maintenance_windows (host, reason, created_by)
            VALUES ($1, $2, $3)
            RETURNING id, host, started_at, ended_at, is_active, reason, created_by,
                      suppressed_alert_count
            ",
        )
        .bind(host)
        .bind(reason)
        .bind(created_by)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let window = window_from_row(&row)?;
        info!(
            window_id = window.id,
            host = host.unwrap_or("all"),
            reason,
            created_by,
            "Maintenance window started"
        );
        Ok((window, true))
    }

    /// Close maintenance windows. Filters by id or host when given; with
    /// neither, closes every active window. Returns the closed windows.
    pub async fn end_maintenance_windows(
        &self,
        window_id: Option<i64>,
        host: Option<&str>,
    ) -> EngineResult<Vec<MaintenanceWindow>> {
        let rows = match (window_id, host) {
            (Some(id), _) => {
                sqlx::query(
                    r"
                    UPDATE maintenance_windows
                    SET ended_at = NOW(), is_active = FALSE
                    WHERE id = $1 AND is_active = TRUE AND ended_at IS NULL
                    RETURNING id, host, started_at, ended_at, is_active, reason, created_by,
                              suppressed_alert_count
                    ",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(h)) => {
                sqlx::query(
                    r"
                    UPDATE maintenance_windows
                    SET ended_at = NOW(), is_active = FALSE
                    WHERE LOWER(host) = LOWER($1) AND is_active = TRUE AND ended_at IS NULL
                    RETURNING id, host, started_at, ended_at, is_active, reason, created_by,
                              suppressed_alert_count
                    ",
                )
                .bind(h)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query(
                    r"
                    UPDATE maintenance_windows
                    SET ended_at = NOW(), is_active = FALSE
                    WHERE is_active = TRUE AND ended_at IS NULL
                    RETURNING id, host, started_at, ended_at, is_active, reason, created_by,
                              suppressed_alert_count
                    ",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let windows = rows
            .iter()
            .map(window_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        for window in &windows {
            info!(
                window_id = window.id,
                host = window.host.as_deref().unwrap_or("all"),
                suppressed = window.suppressed_alert_count,
                "Maintenance window ended"
            );
        }
        Ok(windows)
    }

    /// Active windows plus recently closed ones (last 24 h), for the status
    /// endpoint.
    pub async fn maintenance_status(
        &self,
    ) -> EngineResult<(Vec<MaintenanceWindow>, Vec<MaintenanceWindow>)> {
        let active = sqlx::query(
            r"
            SELECT id, host, started_at, ended_at, is_active, reason, created_by,
                   suppressed_alert_count
            FROM maintenance_windows
            WHERE is_active = TRUE AND ended_at IS NULL
            ORDER BY started_at DESC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        let recent = sqlx::query(
            r"
            SELECT id, host, started_at, ended_at, is_active, reason, created_by,
                   suppressed_alert_count
            FROM maintenance_windows
            WHERE is_active = FALSE
              AND ended_at IS NOT NULL
              AND ended_at > NOW() - INTERVAL '24 hours'
            ORDER BY ended_at DESC
            LIMIT 10
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        let active = active
            .iter()
            .map(window_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let recent = recent
            .iter()
            .map(window_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((active, recent))
    }
}
