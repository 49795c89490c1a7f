//! SSH command execution on the homelab hosts.
//!
//! One cached session per host, reused across calls; a dead session triggers
//! a transparent rebuild. Connect errors are retried with exponential backoff
//! (2s, 4s, 8s); a command timeout is the command's fault and is not retried.
//! A host whose configured address is `localhost` is the box warden itself
//! runs on, so commands for it run in a local subprocess instead of SSH.
//!
//! Calls are single-flight per host (the per-host session lock serializes
//! command batches); calls against different hosts proceed in parallel.

use std::collections::HashMap;
use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::hosts::{HostId, HostMonitor};

/// Connect retries before giving up on a host.
const MAX_CONNECT_RETRIES: u32 = 3;

/// Service flavors the executor knows how to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Docker,
    Systemd,
    System,
    HomeAutomation,
}

impl ServiceKind {
    /// Parse a service kind string. Unknown values are `None`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "docker" => Some(Self::Docker),
            "systemd" => Some(Self::Systemd),
            "system" => Some(Self::System),
            "home-automation" | "homeassistant" => Some(Self::HomeAutomation),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Systemd => "systemd",
            Self::System => "system",
            Self::HomeAutomation => "home-automation",
        }
    }
}

/// Result of executing a command batch on one host.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Commands actually executed (a failed batch stops early).
    pub commands: Vec<String>,
    pub outputs: Vec<String>,
    pub exit_codes: Vec<i32>,
    pub duration_seconds: i64,
    pub error: Option<String>,
}

/// How a single command run failed, if it did.
enum RunFailure {
    /// TCP/handshake/auth problem; the session is gone. Retryable.
    Connect(String),
    /// The command itself timed out or errored mid-flight. Not retryable.
    Command(String),
}

/// Executes commands on remote hosts via SSH.
pub struct SshExecutor {
    configs: HashMap<HostId, HostConfig>,
    sessions: HashMap<HostId, Mutex<Option<ssh2::Session>>>,
    connect_timeout: Duration,
    default_command_timeout: Duration,
    monitor: Arc<HostMonitor>,
}

impl SshExecutor {
    #[must_use]
    pub fn new(
        configs: HashMap<HostId, HostConfig>,
        connect_timeout: Duration,
        default_command_timeout: Duration,
        monitor: Arc<HostMonitor>,
    ) -> Self {
        let sessions = configs.keys().map(|h| (*h, Mutex::new(None))).collect();
        Self {
            configs,
            sessions,
            connect_timeout,
            default_command_timeout,
            monitor,
        }
    }

    /// Whether this host executes locally instead of over SSH.
    fn is_local(&self, host: HostId) -> bool {
        self.configs
            .get(&host)
            .is_some_and(|c| c.address == "localhost" || c.address == "127.0.0.1")
    }

    /// Execute a single command, retrying connect failures with backoff.
    ///
    /// Returns `(stdout, stderr, exit_code)`; SSH-level failures surface as
    /// exit code -1 with the error text in stderr.
    pub async fn execute_command(
        &self,
        host: HostId,
        command: &str,
        timeout: Option<Duration>,
    ) -> (String, String, i32) {
        let timeout = timeout.unwrap_or(self.default_command_timeout);

        if self.is_local(host) {
            return execute_local(command, timeout).await;
        }

        let Some(config) = self.configs.get(&host) else {
            return (
                String::new(),
                format!("unknown host: {host}"),
                -1,
            );
        };

        let Some(session_slot) = self.sessions.get(&host) else {
            return (String::new(), format!("unknown host: {host}"), -1);
        };

        // Single-flight per host: the guard is held across the whole retry
        // loop so command batches never interleave on one session.
        let mut guard = session_slot.lock().await;

        for attempt in 0..MAX_CONNECT_RETRIES {
            if attempt > 0 {
                info!(host = %host, attempt = attempt + 1, command, "Executing command (retry)");
            } else {
                debug!(host = %host, command, timeout_secs = timeout.as_secs(), "Executing command");
            }

            let session = guard.take();
            let config = config.clone();
            let command_owned = command.to_string();
            let connect_timeout = self.connect_timeout;

            let join = tokio::task::spawn_blocking(move || {
                run_blocking(&config, session, &command_owned, timeout, connect_timeout)
            })
            .await;

            let (session, outcome) = match join {
                Ok(pair) => pair,
                Err(e) => (None, Err(RunFailure::Command(format!("executor task failed: {e}")))),
            };
            *guard = session;

            match outcome {
                Ok((stdout, stderr, exit_code)) => {
                    self.monitor.record_connection_attempt(host, true, None).await;
                    info!(
                        host = %host,
                        exit_code,
                        stdout_len = stdout.len(),
                        stderr_len = stderr.len(),
                        "Command executed"
                    );
                    return (stdout, stderr, exit_code);
                }
                Err(RunFailure::Command(msg)) => {
                    // The command's fault, not the connection's; no retry.
                    error!(host = %host, command, error = %msg, "Command failed");
                    return (String::new(), msg, -1);
                }
                Err(RunFailure::Connect(msg)) => {
                    self.monitor
                        .record_connection_attempt(host, false, Some(msg.clone()))
                        .await;

                    let is_last = attempt + 1 == MAX_CONNECT_RETRIES;
                    warn!(
                        host = %host,
                        attempt = attempt + 1,
                        max_retries = MAX_CONNECT_RETRIES,
                        error = %msg,
                        last_attempt = is_last,
                        "SSH connect error"
                    );

                    if is_last {
                        return (
                            String::new(),
                            format!("SSH connection failed after {MAX_CONNECT_RETRIES} attempts: {msg}"),
                            -1,
                        );
                    }

                    // 2s, 4s, 8s
                    tokio::time::sleep(Duration::from_secs(2 << attempt)).await;
                }
            }
        }

        (String::new(), "unexpected retry loop exit".to_string(), -1)
    }

    /// Execute a command sequence; stops at the first non-zero exit.
    ///
    /// The returned arrays cover only the commands that actually ran and are
    /// always equal length.
    pub async fn execute_commands(
        &self,
        host: HostId,
        commands: &[String],
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        let start = Utc::now();
        let mut outputs = Vec::new();
        let mut exit_codes = Vec::new();
        let mut success = true;

        info!(host = %host, command_count = commands.len(), "Executing command batch");

        for cmd in commands {
            let (stdout, stderr, exit_code) = self.execute_command(host, cmd, timeout).await;

            let output = if stderr.is_empty() {
                stdout
            } else {
                format!("STDOUT:\n{stdout}\n\nSTDERR:\n{stderr}")
            };
            outputs.push(output);
            exit_codes.push(exit_code);

            if exit_code != 0 {
                success = false;
                warn!(host = %host, command = %cmd, exit_code, "Command failed in batch");
                break;
            }
        }

        let duration = (Utc::now() - start).num_seconds();
        let error = if success {
            None
        } else {
            exit_codes
                .last()
                .map(|code| format!("Command failed with exit code {code}"))
        };

        info!(
            host = %host,
            success,
            duration_seconds = duration,
            executed = outputs.len(),
            total = commands.len(),
            "Command batch completed"
        );

        ExecutionResult {
            success,
            commands: commands[..outputs.len()].to_vec(),
            outputs,
            exit_codes,
            duration_seconds: duration,
            error,
        }
    }

    /// Gather logs from a service on a host.
    pub async fn gather_logs(
        &self,
        host: HostId,
        kind: ServiceKind,
        service_name: Option<&str>,
        lines: u32,
    ) -> String {
        let command = log_command(kind, service_name, lines);

        info!(host = %host, kind = kind.as_str(), service = service_name, lines, "Gathering logs");

        let (stdout, stderr, exit_code) = self.execute_command(host, &command, None).await;
        if exit_code == 0 {
            stdout
        } else {
            warn!(host = %host, service = service_name, error = %stderr, "Log gathering failed");
            format!("Failed to gather logs: {stderr}")
        }
    }

    /// Check the status of a service.
    pub async fn check_service_status(
        &self,
        host: HostId,
        service_name: &str,
        kind: ServiceKind,
    ) -> String {
        let command = status_command(kind, service_name);
        let (stdout, stderr, exit_code) = self.execute_command(host, &command, None).await;
        if exit_code == 0 {
            stdout
        } else {
            format!("Error: {stderr}")
        }
    }

    /// Close all cached sessions. Called on shutdown.
    pub async fn close_all(&self) {
        for (host, slot) in &self.sessions {
            let mut guard = slot.lock().await;
            if let Some(session) = guard.take() {
                let _ = session.disconnect(None, "warden shutdown", None);
                info!(host = %host, "SSH session closed");
            }
        }
    }
}

/// Build the log-gathering command for a service kind.
fn log_command(kind: ServiceKind, service_name: Option<&str>, lines: u32) -> String {
    let name = service_name.unwrap_or_default();
    match kind {
        ServiceKind::Docker => format!("docker logs --tail {lines} {name} 2>&1"),
        ServiceKind::Systemd => format!("journalctl -u {name} -n {lines} --no-pager"),
        ServiceKind::System => format!("dmesg | tail -{lines}"),
        ServiceKind::HomeAutomation => format!("ha core logs | tail -{lines}"),
    }
}

/// Build the status-probe command for a service kind.
fn status_command(kind: ServiceKind, service_name: &str) -> String {
    match kind {
        ServiceKind::Docker => {
            format!("docker ps --filter name={service_name} --format '{{{{.Status}}}}'")
        }
        ServiceKind::HomeAutomation => "ha core info".to_string(),
        _ => format!("systemctl is-active {service_name}"),
    }
}

/// Run one command over an existing or fresh session. Returns the session
/// for reuse alongside the outcome.
fn run_blocking(
    config: &HostConfig,
    session: Option<ssh2::Session>,
    command: &str,
    command_timeout: Duration,
    connect_timeout: Duration,
) -> (Option<ssh2::Session>, Result<(String, String, i32), RunFailure>) {
    // Try the cached session first; a failure to open a channel means the
    // connection died underneath us and we rebuild.
    if let Some(session) = session {
        match exec_on_session(&session, command, command_timeout) {
            Ok(result) => return (Some(session), Ok(result)),
            Err(RunFailure::Command(msg)) => return (Some(session), Err(RunFailure::Command(msg))),
            Err(RunFailure::Connect(_)) => {
                debug!(host = %config.address, "Cached session dead, rebuilding");
            }
        }
    }

    let session = match connect_session(config, connect_timeout) {
        Ok(s) => s,
        Err(msg) => return (None, Err(RunFailure::Connect(msg))),
    };

    match exec_on_session(&session, command, command_timeout) {
        Ok(result) => (Some(session), Ok(result)),
        Err(failure) => (None, Err(failure)),
    }
}

/// Open, handshake, and authenticate a new session.
fn connect_session(config: &HostConfig, connect_timeout: Duration) -> Result<ssh2::Session, String> {
    let addr = if config.address.contains(':') {
        config.address.clone()
    } else {
        format!("{}:22", config.address)
    };

    use std::net::ToSocketAddrs;
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| format!("resolve {addr}: {e}"))?
        .next()
        .ok_or_else(|| format!("no address for {addr}"))?;

    let tcp = TcpStream::connect_timeout(&socket_addr, connect_timeout)
        .map_err(|e| format!("connect {addr}: {e}"))?;

    let mut session = ssh2::Session::new().map_err(|e| format!("session init: {e}"))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| format!("handshake {addr}: {e}"))?;
    // Homelab environment: host keys are not pinned, auth is key-only.
    session
        .userauth_pubkey_file(&config.user, None, Path::new(&config.key_path), None)
        .map_err(|e| format!("auth {}@{addr}: {e}", config.user))?;

    debug!(address = %addr, user = %config.user, "SSH session established");
    Ok(session)
}

/// Run one command on a live session.
fn exec_on_session(
    session: &ssh2::Session,
    command: &str,
    command_timeout: Duration,
) -> Result<(String, String, i32), RunFailure> {
    // ssh2 timeouts are per blocking operation, in milliseconds; 0 is "wait
    // forever", so clamp up to at least 1ms.
    let timeout_ms = u32::try_from(command_timeout.as_millis().max(1)).unwrap_or(u32::MAX);
    session.set_timeout(timeout_ms);

    let mut channel = session
        .channel_session()
        .map_err(|e| RunFailure::Connect(format!("channel open: {e}")))?;

    channel
        .exec(command)
        .map_err(|e| RunFailure::Connect(format!("exec: {e}")))?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    channel.read_to_string(&mut stdout).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock {
            RunFailure::Command(format!(
                "Command timed out after {} seconds",
                command_timeout.as_secs()
            ))
        } else {
            RunFailure::Command(format!("read stdout: {e}"))
        }
    })?;
    let _ = channel.stderr().read_to_string(&mut stderr);

    channel
        .wait_close()
        .map_err(|e| RunFailure::Command(format!("wait close: {e}")))?;
    let exit_code = channel
        .exit_status()
        .map_err(|e| RunFailure::Command(format!("exit status: {e}")))?;

    Ok((
        stdout.trim().to_string(),
        stderr.trim().to_string(),
        exit_code,
    ))
}

/// Execute a command locally via a subprocess (the "I'm running on the box
/// I'm remediating" case).
async fn execute_local(command: &str, timeout: Duration) -> (String, String, i32) {
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn();

    let child = match child {
        Ok(c) => c,
        Err(e) => return (String::new(), e.to_string(), -1),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            (stdout, stderr, exit_code)
        }
        Ok(Err(e)) => (String::new(), e.to_string(), -1),
        Err(_) => (
            String::new(),
            format!("Command timed out after {} seconds", timeout.as_secs()),
            -1,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use notify::Notifier;

    fn executor_with_local(host: HostId) -> SshExecutor {
        let mut configs = HashMap::new();
        configs.insert(
            host,
            HostConfig {
                address: "localhost".to_string(),
                user: "root".to_string(),
                key_path: "/tmp/nonexistent".to_string(),
            },
        );
        let monitor = Arc::new(HostMonitor::new(
            Arc::new(Store::disconnected()),
            Arc::new(Notifier::disabled()),
            HashMap::new(),
        ));
        SshExecutor::new(
            configs,
            Duration::from_secs(1),
            Duration::from_secs(10),
            monitor,
        )
    }

    #[test]
    fn test_log_command_shapes() {
        assert_eq!(
            log_command(ServiceKind::Docker, Some("caddy"), 100),
            "docker logs --tail 100 caddy 2>&1"
        );
        assert_eq!(
            log_command(ServiceKind::Systemd, Some("nginx"), 50),
            "journalctl -u nginx -n 50 --no-pager"
        );
        assert_eq!(log_command(ServiceKind::System, None, 25), "dmesg | tail -25");
    }

    #[test]
    fn test_status_command_shapes() {
        assert_eq!(
            status_command(ServiceKind::Docker, "caddy"),
            "docker ps --filter name=caddy --format '{{.Status}}'"
        );
        assert_eq!(
            status_command(ServiceKind::Systemd, "nginx"),
            "systemctl is-active nginx"
        );
    }

    #[test]
    fn test_service_kind_parse() {
        assert_eq!(ServiceKind::parse("docker"), Some(ServiceKind::Docker));
        assert_eq!(
            ServiceKind::parse("homeassistant"),
            Some(ServiceKind::HomeAutomation)
        );
        assert_eq!(ServiceKind::parse("bogus"), None);
    }

    #[tokio::test]
    async fn test_local_execution_success() {
        let exec = executor_with_local(HostId::Keep);
        let (stdout, _, code) = exec
            .execute_command(HostId::Keep, "echo warden-local", None)
            .await;
        assert_eq!(code, 0);
        assert_eq!(stdout, "warden-local");
    }

    #[tokio::test]
    async fn test_local_batch_stops_on_failure() {
        let exec = executor_with_local(HostId::Keep);
        let result = exec
            .execute_commands(
                HostId::Keep,
                &[
                    "true".to_string(),
                    "false".to_string(),
                    "echo never-runs".to_string(),
                ],
                None,
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.commands.len(), 2);
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.exit_codes, vec![0, 1]);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_local_timeout() {
        let exec = executor_with_local(HostId::Keep);
        let (_, stderr, code) = exec
            .execute_command(
                HostId::Keep,
                "sleep 5",
                Some(Duration::from_millis(100)),
            )
            .await;
        assert_eq!(code, -1);
        assert!(stderr.contains("timed out"));
    }
}
