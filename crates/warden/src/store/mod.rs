//! Pooled Postgres persistence.
//!
//! All access goes through [`Store`], which owns the connection pool. DAO
//! methods live in per-table submodules and use parameterized queries only;
//! queries are runtime-bound strings so the build has no database dependency.
//! The schema ships in `migrations/0001_init.sql`.

pub mod attempts;
pub mod cooldowns;
pub mod handoffs;
pub mod maintenance;
pub mod patterns;

pub use attempts::{AttemptRow, RemediationAttempt, RemediationStats};
pub use cooldowns::FingerprintDecision;
pub use handoffs::HandoffRow;
pub use maintenance::MaintenanceWindow;
pub use patterns::{FailurePattern, Pattern};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::hosts::HostState;

/// Maximum connect retries before startup fails.
const CONNECT_MAX_RETRIES: u32 = 10;
/// Initial connect retry delay in seconds.
const CONNECT_BASE_DELAY_SECS: u64 = 1;
/// Connect retry delay ceiling in seconds.
const CONNECT_MAX_DELAY_SECS: u64 = 30;

/// Postgres-backed store for all durable engine state.
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Establish the connection pool with retry and exponential backoff
    /// (1s, 2s, 4s, ... capped at 30s). This lets the engine start while its
    /// database container is still initializing. A pool from a failed attempt
    /// is closed before the next try so retries cannot leak connections.
    pub async fn connect(database_url: &str, pool_size: u32) -> EngineResult<Self> {
        let mut last_err: Option<sqlx::Error> = None;

        for attempt in 0..CONNECT_MAX_RETRIES {
            match PgPoolOptions::new()
                .min_connections(1)
                .max_connections(pool_size)
                .acquire_timeout(Duration::from_secs(30))
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    // The pool connects lazily beyond min_connections; run a
                    // probe so a bad DSN fails here, not mid-pipeline.
                    match sqlx::query("SELECT 1").execute(&pool).await {
                        Ok(_) => {
                            info!(pool_size, "Database connected");
                            return Ok(Self { pool });
                        }
                        Err(e) => {
                            pool.close().await;
                            last_err = Some(e);
                        }
                    }
                }
                Err(e) => last_err = Some(e),
            }

            if attempt + 1 == CONNECT_MAX_RETRIES {
                break;
            }

            let delay =
                (CONNECT_BASE_DELAY_SECS << attempt).min(CONNECT_MAX_DELAY_SECS);
            warn!(
                attempt = attempt + 1,
                max_retries = CONNECT_MAX_RETRIES,
                delay_secs = delay,
                error = %last_err.as_ref().map_or_else(String::new, ToString::to_string),
                "Database connect failed, retrying"
            );
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        let final_error = last_err.map_or_else(String::new, |e| e.to_string());
        error!(
            total_attempts = CONNECT_MAX_RETRIES,
            error = %final_error,
            "Database connect retries exhausted"
        );
        Err(EngineError::Transient(format!(
            "database connect failed after {CONNECT_MAX_RETRIES} attempts: {final_error}"
        )))
    }

    /// A store whose pool points nowhere and fails fast.
    ///
    /// Used by unit tests that exercise degraded paths without a database.
    #[must_use]
    pub fn disconnected() -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(500))
            .connect_lazy("postgres://warden@127.0.0.1:1/warden")
            .expect("lazy pool construction cannot fail");
        Self { pool }
    }

    /// Close the pool. Called once on shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database disconnected");
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Database health check failed");
                false
            }
        }
    }

    /// The underlying pool, for callers that need transactional control
    /// (self-preservation's advisory-lock transaction).
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append a host-status snapshot to the status log.
    pub async fn record_host_status(&self, state: &HostState) -> EngineResult<()> {
        sqlx::query(
            r"
            INSERT INTO host_status_log
                (host, status, failure_count, last_success_at, last_check_at, error_message)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(state.host.as_str())
        .bind(state.status.as_str())
        .bind(i64::from(state.failure_count))
        .bind(state.last_success_at)
        .bind(state.last_attempt_at)
        .bind(state.error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a proactive-check finding.
    pub async fn record_proactive_check(
        &self,
        check_type: &str,
        target: &str,
        finding: &str,
        action_taken: Option<&str>,
    ) -> EngineResult<()> {
        sqlx::query(
            r"
            INSERT INTO proactive_checks (check_type, target, finding, action_taken)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(check_type)
        .bind(target)
        .bind(finding)
        .bind(action_taken)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
