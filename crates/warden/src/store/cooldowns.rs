//! Fingerprint deduplication cache and escalation cooldowns.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, info, warn};

use super::Store;
use crate::error::{EngineError, EngineResult};

/// Result of the atomic fingerprint check-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintDecision {
    /// Not seen within the cooldown; the fingerprint is now recorded and the
    /// caller owns processing this alert.
    Process,
    /// Seen within the cooldown; skip.
    InCooldown,
}

impl Store {
    /// Atomically check whether a fingerprint is in cooldown and record it
    /// as processed if not.
    ///
    /// Both steps run inside one transaction: a cooldown SELECT, then an
    /// UPSERT whose WHERE clause only fires when the stored `processed_at`
    /// is older than the cooldown. Two simultaneous deliveries of the same
    /// fingerprint therefore cannot both win - the second conflicts on the
    /// primary key and sees a fresh `processed_at`.
    ///
    /// On store error the check fails open (the alert is processed) so a
    /// database outage cannot silently drop alerts.
    pub async fn check_and_set_fingerprint(
        &self,
        fingerprint: &str,
        alert_name: &str,
        alert_instance: &str,
        cooldown_seconds: i64,
    ) -> (FingerprintDecision, Option<DateTime<Utc>>) {
        let result: EngineResult<(FingerprintDecision, Option<DateTime<Utc>>)> = async {
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query(
                r"
                SELECT processed_at
                FROM alert_processing_cache
                WHERE fingerprint = $1
                  AND processed_at > NOW() - ($2 * INTERVAL '1 second')
                FOR UPDATE
                ",
            )
            .bind(fingerprint)
            .bind(cooldown_seconds)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                let processed_at: DateTime<Utc> = row.try_get("processed_at")?;
                tx.rollback().await?;
                return Ok((FingerprintDecision::InCooldown, Some(processed_at)));
            }

            sqlx::query(
                r"
                INSERT INTO alert_processing_cache (fingerprint, alert_name, alert_instance, processed_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (fingerprint) DO UPDATE
                SET processed_at = NOW(),
                    alert_name = EXCLUDED.alert_name,
                    alert_instance = EXCLUDED.alert_instance
                WHERE alert_processing_cache.processed_at <= NOW() - ($4 * INTERVAL '1 second')
                ",
            )
            .bind(fingerprint)
            .bind(alert_name)
            .bind(alert_instance)
            .bind(cooldown_seconds)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok((FingerprintDecision::Process, None))
        }
        .await;

        match result {
            Ok(decision) => decision,
            Err(e) => {
                // Fail open: a DB outage must not block alert processing.
                warn!(
                    fingerprint = &fingerprint[..fingerprint.len().min(16)],
                    error = %e,
                    "Fingerprint check-and-set failed, processing anyway"
                );
                (FingerprintDecision::Process, None)
            }
        }
    }

    /// Reap fingerprint cache entries older than `max_age_hours`.
    pub async fn cleanup_fingerprint_cache(&self, max_age_hours: i64) -> EngineResult<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM alert_processing_cache
            WHERE processed_at < NOW() - ($1 * INTERVAL '1 hour')
            ",
        )
        .bind(max_age_hours)
        .execute(&self.pool)
        .await?;

        let count = result.rows_affected();
        if count > 0 {
            info!(deleted = count, max_age_hours, "Fingerprint cache reaped");
        }
        Ok(count)
    }

    /// Record an escalation, starting (or refreshing) its cooldown.
    ///
    /// Best-effort: a failure here only risks a duplicate notification later,
    /// so it is logged at warn and swallowed.
    pub async fn set_escalation_cooldown(&self, alert_name: &str, alert_instance: &str) {
        let result = sqlx::query(
            r"
            INSERT INTO escalation_cooldowns (alert_name, alert_instance, escalated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (alert_name, alert_instance)
            DO UPDATE SET escalated_at = NOW()
            ",
        )
        .bind(alert_name)
        .bind(alert_instance)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => info!(alert_name, alert_instance, "Escalation cooldown set"),
            Err(e) => warn!(
                alert_name,
                alert_instance,
                error = %e,
                "Failed to set escalation cooldown"
            ),
        }
    }

    /// Check whether an identity is inside its escalation cooldown.
    pub async fn check_escalation_cooldown(
        &self,
        alert_name: &str,
        alert_instance: &str,
        cooldown_hours: i64,
    ) -> EngineResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            r"
            SELECT escalated_at
            FROM escalation_cooldowns
            WHERE alert_name = $1
              AND alert_instance = $2
              AND escalated_at > NOW() - ($3 * INTERVAL '1 hour')
            ",
        )
        .bind(alert_name)
        .bind(alert_instance)
        .bind(cooldown_hours)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let escalated_at: DateTime<Utc> = row.try_get("escalated_at")?;
                debug!(alert_name, alert_instance, %escalated_at, "Escalation cooldown active");
                Ok(Some(escalated_at))
            }
            None => Ok(None),
        }
    }

    /// Clear an escalation cooldown when the alert resolves, so a fresh
    /// incident escalates again. Errors propagate: a silent failure here
    /// would block future escalations.
    pub async fn clear_escalation_cooldown(
        &self,
        alert_name: &str,
        alert_instance: &str,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r"
            DELETE FROM escalation_cooldowns
            WHERE alert_name = $1
              AND alert_instance = $2
            ",
        )
        .bind(alert_name)
        .bind(alert_instance)
        .execute(&self.pool)
        .await
        .map_err(EngineError::from)?;

        let cleared = result.rows_affected() > 0;
        if cleared {
            info!(alert_name, alert_instance, "Escalation cooldown cleared");
        }
        Ok(cleared)
    }
}
