//! Engine configuration, loaded from environment variables at startup.

use anyhow::{Context, Result};
use std::time::Duration;

/// SSH connection parameters for one host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address (hostname or IP); "localhost" selects local subprocess execution
    pub address: String,
    /// SSH user
    pub user: String,
    /// Path to the private key
    pub key_path: String,
}

/// Application settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    // API server
    pub bind_host: String,
    pub port: u16,
    /// External URL the orchestrator uses to reach warden (callbacks, health)
    pub external_url: Option<String>,

    // Database
    pub database_url: String,
    pub database_pool_size: u32,

    // LLM
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub llm_timeout: Duration,

    // SSH hosts
    pub forge: HostConfig,
    pub haven: HostConfig,
    pub outpost: HostConfig,
    pub keep: HostConfig,
    pub ssh_connection_timeout: Duration,
    pub command_execution_timeout: Duration,

    // External backends
    pub prometheus_url: String,
    pub loki_url: String,
    pub orchestrator_url: Option<String>,
    pub home_automation_token: Option<String>,
    pub orchestrator_api_key: Option<String>,

    // Remediation gates
    pub max_attempts_per_alert: i64,
    pub attempt_window_hours: i64,
    pub fingerprint_cooldown_seconds: i64,
    pub escalation_cooldown_hours: i64,

    // Verification
    pub verification_enabled: bool,
    pub verification_max_wait: Duration,
    pub verification_poll_interval: Duration,
    pub verification_initial_delay: Duration,

    // Background tasks
    pub proactive_check_interval: Duration,
    pub stale_handoff_cleanup_minutes: i64,

    // Security
    pub webhook_auth_username: String,
    pub webhook_auth_password: String,

    // Runbooks
    pub runbook_dir: String,
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required environment variable {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn host_config(prefix: &str, default_addr: &str, default_user: &str) -> HostConfig {
    HostConfig {
        address: env_or(&format!("SSH_{prefix}_HOST"), default_addr),
        user: env_or(&format!("SSH_{prefix}_USER"), default_user),
        key_path: env_or(&format!("SSH_{prefix}_KEY_PATH"), "/app/ssh_key"),
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// # Errors
    /// Returns an error if a required variable (database URL, LLM key,
    /// webhook credentials, Discord webhook) is absent.
    pub fn from_env() -> Result<Self> {
        // Discord webhook is consumed by the notify crate, but its absence is
        // a deployment mistake worth failing loudly on.
        env_var("DISCORD_WEBHOOK_URL")?;

        Ok(Self {
            app_name: "Warden".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),

            bind_host: env_or("HOST", "0.0.0.0"),
            port: env_parse("PORT", 8000),
            external_url: std::env::var("WARDEN_EXTERNAL_URL").ok(),

            database_url: env_var("DATABASE_URL")?,
            database_pool_size: env_parse("DATABASE_POOL_SIZE", 10),

            llm_api_key: env_var("ANTHROPIC_API_KEY")?,
            llm_model: env_or("LLM_MODEL", "claude-sonnet-4-5-20250929"),
            llm_max_tokens: env_parse("LLM_MAX_TOKENS", 4000),
            llm_timeout: Duration::from_secs(env_parse("LLM_TIMEOUT", 60)),

            forge: host_config("FORGE", "192.168.0.11", "ops"),
            haven: host_config("HAVEN", "192.168.0.10", "root"),
            outpost: host_config("OUTPOST", "localhost", "root"),
            keep: host_config("KEEP", "192.168.0.13", "ops"),
            ssh_connection_timeout: Duration::from_secs(env_parse("SSH_CONNECTION_TIMEOUT", 10)),
            command_execution_timeout: Duration::from_secs(env_parse(
                "COMMAND_EXECUTION_TIMEOUT",
                60,
            )),

            prometheus_url: env_or("PROMETHEUS_URL", "http://192.168.0.11:9090"),
            loki_url: env_or("LOKI_URL", "http://192.168.0.11:3100"),
            orchestrator_url: std::env::var("ORCHESTRATOR_URL").ok(),
            home_automation_token: std::env::var("HA_TOKEN").ok(),
            orchestrator_api_key: std::env::var("ORCHESTRATOR_API_KEY").ok(),

            max_attempts_per_alert: env_parse("MAX_ATTEMPTS_PER_ALERT", 3),
            attempt_window_hours: env_parse("ATTEMPT_WINDOW_HOURS", 2),
            fingerprint_cooldown_seconds: env_parse("FINGERPRINT_COOLDOWN_SECONDS", 300),
            escalation_cooldown_hours: env_parse("ESCALATION_COOLDOWN_HOURS", 4),

            verification_enabled: env_parse("VERIFICATION_ENABLED", true),
            verification_max_wait: Duration::from_secs(env_parse("VERIFICATION_MAX_WAIT", 120)),
            verification_poll_interval: Duration::from_secs(env_parse(
                "VERIFICATION_POLL_INTERVAL",
                10,
            )),
            verification_initial_delay: Duration::from_secs(env_parse(
                "VERIFICATION_INITIAL_DELAY",
                10,
            )),

            proactive_check_interval: Duration::from_secs(env_parse(
                "PROACTIVE_CHECK_INTERVAL",
                900,
            )),
            stale_handoff_cleanup_minutes: env_parse("STALE_HANDOFF_CLEANUP_MINUTES", 30),

            webhook_auth_username: env_or("WEBHOOK_AUTH_USERNAME", "alertmanager"),
            webhook_auth_password: env_var("WEBHOOK_AUTH_PASSWORD")?,

            runbook_dir: env_or("RUNBOOK_DIR", "/app/runbooks"),
        })
    }

    /// The URL the orchestrator should use to call back into warden.
    ///
    /// Falls back to the keep host address when no external URL is set; that
    /// works in the common single-LAN deployment but is logged as a warning
    /// at startup.
    #[must_use]
    pub fn callback_base_url(&self) -> String {
        self.external_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.keep.address, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_defaults() {
        assert_eq!(env_parse("WARDEN_TEST_UNSET_NUMERIC", 42_i64), 42);
        assert!(env_parse("WARDEN_TEST_UNSET_BOOL", true));
    }

    #[test]
    fn test_host_config_defaults() {
        let hc = host_config("WARDEN_TEST_UNSET", "10.0.0.1", "ops");
        assert_eq!(hc.address, "10.0.0.1");
        assert_eq!(hc.user, "ops");
        assert_eq!(hc.key_path, "/app/ssh_key");
    }
}
