//! Host identities and availability monitoring.
//!
//! The fleet is a closed set of four hosts. The monitor tracks per-host
//! connectivity from SSH outcomes and drives alert suppression: three
//! consecutive connect failures mark a host OFFLINE, a background loop pings
//! offline hosts every five minutes, and a successful ping moves the host to
//! CHECKING so the next real SSH attempt can confirm recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::Store;
use notify::{Notifier, NotifyEvent};

/// The closed set of remediation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostId {
    /// Primary Docker services host
    Forge,
    /// Home automation hub
    Haven,
    /// Cloud VPS gateway
    Outpost,
    /// The host warden itself runs on
    Keep,
}

impl HostId {
    /// All hosts, in routing-priority order.
    pub const ALL: [Self; 4] = [Self::Forge, Self::Haven, Self::Outpost, Self::Keep];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Forge => "forge",
            Self::Haven => "haven",
            Self::Outpost => "outpost",
            Self::Keep => "keep",
        }
    }

    /// Parse a host name (case-insensitive). Returns `None` for unknown names.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "forge" => Some(Self::Forge),
            "haven" | "ha" | "homeassistant" => Some(Self::Haven),
            "outpost" | "vps" => Some(Self::Outpost),
            "keep" => Some(Self::Keep),
            _ => None,
        }
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host connectivity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostStatus {
    Online,
    Offline,
    Checking,
}

impl HostStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
            Self::Checking => "CHECKING",
        }
    }
}

/// Current state of a monitored host.
#[derive(Debug, Clone, Serialize)]
pub struct HostState {
    pub host: HostId,
    pub status: HostStatus,
    pub failure_count: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl HostState {
    fn new(host: HostId) -> Self {
        Self {
            host,
            status: HostStatus::Online,
            failure_count: 0,
            last_success_at: None,
            last_attempt_at: None,
            error: None,
        }
    }
}

/// Consecutive connect failures before a host is declared offline.
const MAX_FAILURES_BEFORE_OFFLINE: u32 = 3;

/// How often the background loop re-checks offline hosts.
const OFFLINE_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Ping timeout in seconds.
const PING_TIMEOUT_SECS: u64 = 5;

/// Monitors host availability and manages connectivity status.
pub struct HostMonitor {
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    /// Host name -> ping address
    addresses: HashMap<HostId, String>,
    states: Arc<RwLock<HashMap<HostId, HostState>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HostMonitor {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        notifier: Arc<Notifier>,
        addresses: HashMap<HostId, String>,
    ) -> Self {
        let states = HostId::ALL
            .iter()
            .map(|h| (*h, HostState::new(*h)))
            .collect();

        Self {
            store,
            notifier,
            addresses,
            states: Arc::new(RwLock::new(states)),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Start the background recovery-check loop.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(OFFLINE_CHECK_INTERVAL).await;
                monitor.check_offline_hosts().await;
            }
        });
        *self.task.lock().expect("host monitor task lock") = Some(handle);
        info!("Host monitor started");
    }

    /// Stop the background loop.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().expect("host monitor task lock").take() {
            handle.abort();
        }
        info!("Host monitor stopped");
    }

    /// Record the result of a connection attempt from the SSH executor.
    pub async fn record_connection_attempt(
        &self,
        host: HostId,
        success: bool,
        error: Option<String>,
    ) {
        let notification = {
            let mut states = self.states.write().await;
            let state = states.entry(host).or_insert_with(|| HostState::new(host));
            state.last_attempt_at = Some(Utc::now());

            if success {
                let was_offline = state.status == HostStatus::Offline;
                let downtime = if was_offline {
                    state.last_success_at.map(|t| (Utc::now() - t).num_seconds())
                } else {
                    None
                };
                state.status = HostStatus::Online;
                state.failure_count = 0;
                state.last_success_at = Some(Utc::now());
                state.error = None;

                debug!(host = %host, "Connection successful");

                was_offline.then(|| NotifyEvent::HostRecovered {
                    host: host.as_str().to_string(),
                    downtime_secs: downtime,
                    timestamp: Utc::now(),
                })
            } else {
                state.failure_count += 1;
                state.error.clone_from(&error);

                warn!(
                    host = %host,
                    failure_count = state.failure_count,
                    error = error.as_deref().unwrap_or("unknown"),
                    "Connection failed"
                );

                if state.failure_count >= MAX_FAILURES_BEFORE_OFFLINE
                    && state.status != HostStatus::Offline
                {
                    state.status = HostStatus::Offline;
                    error!(host = %host, failures = state.failure_count, "Host marked offline");
                    Some(NotifyEvent::HostOffline {
                        host: host.as_str().to_string(),
                        failure_count: state.failure_count,
                        error,
                        timestamp: Utc::now(),
                    })
                } else {
                    None
                }
            }
        };

        if let Some(event) = notification {
            self.notifier.notify(event);
        }

        self.persist_state(host).await;
    }

    /// Whether a host is currently usable for remediation.
    ///
    /// ONLINE and CHECKING both count as available; CHECKING means a ping
    /// succeeded and the next SSH attempt decides.
    pub async fn is_available(&self, host: HostId) -> bool {
        let states = self.states.read().await;
        states
            .get(&host)
            .is_none_or(|s| s.status != HostStatus::Offline)
    }

    /// Get a snapshot of one host's state.
    pub async fn status(&self, host: HostId) -> Option<HostState> {
        self.states.read().await.get(&host).cloned()
    }

    /// Get a snapshot of all host states.
    pub async fn all_statuses(&self) -> Vec<HostState> {
        self.states.read().await.values().cloned().collect()
    }

    /// Ping every OFFLINE host; promote responders to CHECKING.
    async fn check_offline_hosts(&self) {
        let offline: Vec<HostId> = {
            let states = self.states.read().await;
            states
                .values()
                .filter(|s| s.status == HostStatus::Offline)
                .map(|s| s.host)
                .collect()
        };

        for host in offline {
            let Some(address) = self.addresses.get(&host) else {
                continue;
            };

            info!(host = %host, "Checking offline host for recovery");
            if ping_host(address).await {
                info!(host = %host, "Host answered ping, marking CHECKING");
                let mut states = self.states.write().await;
                if let Some(state) = states.get_mut(&host) {
                    state.status = HostStatus::Checking;
                    state.error = None;
                }
            } else {
                debug!(host = %host, "Host still offline");
            }
        }
    }

    /// Persist the current state of one host to the status log.
    async fn persist_state(&self, host: HostId) {
        let snapshot = { self.states.read().await.get(&host).cloned() };
        if let Some(state) = snapshot {
            if let Err(e) = self.store.record_host_status(&state).await {
                // Non-critical path: the in-memory state is authoritative.
                warn!(host = %host, error = %e, "Failed to persist host status");
            }
        }
    }
}

/// Ping a host once to check basic connectivity.
async fn ping_host(address: &str) -> bool {
    let result = tokio::time::timeout(
        Duration::from_secs(PING_TIMEOUT_SECS + 2),
        tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", &PING_TIMEOUT_SECS.to_string(), address])
            .output(),
    )
    .await;

    matches!(result, Ok(Ok(output)) if output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Arc<HostMonitor> {
        Arc::new(HostMonitor::new(
            Arc::new(Store::disconnected()),
            Arc::new(Notifier::disabled()),
            HashMap::new(),
        ))
    }

    #[test]
    fn test_host_id_parse() {
        assert_eq!(HostId::parse("forge"), Some(HostId::Forge));
        assert_eq!(HostId::parse("OUTPOST"), Some(HostId::Outpost));
        assert_eq!(HostId::parse("vps"), Some(HostId::Outpost));
        assert_eq!(HostId::parse("homeassistant"), Some(HostId::Haven));
        assert_eq!(HostId::parse("unknown-box"), None);
    }

    #[tokio::test]
    async fn test_offline_after_three_failures() {
        let m = monitor();

        for _ in 0..2 {
            m.record_connection_attempt(HostId::Forge, false, Some("timeout".into()))
                .await;
            assert!(m.is_available(HostId::Forge).await);
        }

        m.record_connection_attempt(HostId::Forge, false, Some("timeout".into()))
            .await;
        assert!(!m.is_available(HostId::Forge).await);

        let state = m.status(HostId::Forge).await.unwrap();
        assert_eq!(state.status, HostStatus::Offline);
        assert_eq!(state.failure_count, 3);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let m = monitor();

        m.record_connection_attempt(HostId::Haven, false, Some("refused".into()))
            .await;
        m.record_connection_attempt(HostId::Haven, true, None).await;

        let state = m.status(HostId::Haven).await.unwrap();
        assert_eq!(state.status, HostStatus::Online);
        assert_eq!(state.failure_count, 0);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_recovery_from_offline() {
        let m = monitor();

        for _ in 0..3 {
            m.record_connection_attempt(HostId::Outpost, false, None).await;
        }
        assert!(!m.is_available(HostId::Outpost).await);

        m.record_connection_attempt(HostId::Outpost, true, None).await;
        assert!(m.is_available(HostId::Outpost).await);
        assert_eq!(
            m.status(HostId::Outpost).await.unwrap().status,
            HostStatus::Online
        );
    }
}
