//! Notification event types for warden remediation outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity levels for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Get the Discord embed color for this severity.
    #[must_use]
    pub const fn color(&self) -> u32 {
        match self {
            Self::Info => 0x0034_98db,     // Blue
            Self::Warning => 0x00f3_9c12,  // Orange
            Self::Critical => 0x00e7_4c3c, // Red
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// A compressed view of one prior remediation attempt, used in escalations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub attempt_number: i32,
    pub commands: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    // =========================================================================
    // Remediation lifecycle
    // =========================================================================
    /// An alert was remediated and verified resolved
    RemediationSucceeded {
        alert_name: String,
        alert_instance: String,
        attempt_number: i32,
        max_attempts: i32,
        duration_secs: i64,
        analysis: String,
        commands: Vec<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A remediation attempt failed (shell failure or verification failure)
    RemediationFailed {
        alert_name: String,
        alert_instance: String,
        attempt_number: i32,
        max_attempts: i32,
        error: String,
        commands: Vec<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Automation is exhausted; a human needs to look
    Escalation {
        alert_name: String,
        alert_instance: String,
        attempts: i32,
        last_reasoning: Option<String>,
        previous_attempts: Vec<AttemptSummary>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The LLM proposed commands the validator refused
    UnsafePlan {
        alert_name: String,
        alert_instance: String,
        rejected_commands: Vec<String>,
        reasons: Vec<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Host availability
    // =========================================================================
    /// A host stopped answering SSH and was marked offline
    HostOffline {
        host: String,
        failure_count: u32,
        error: Option<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A previously offline host answered again
    HostRecovered {
        host: String,
        downtime_secs: Option<i64>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// Consolidated report of alerts suppressed while a host was offline
    SuppressionSummary {
        host: String,
        suppressed_count: u32,
        critical_count: u32,
        warning_count: u32,
        alert_names: Vec<String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Maintenance windows
    // =========================================================================
    /// A maintenance window opened; remediation is paused for its scope
    MaintenanceStarted {
        scope: String,
        reason: String,
        created_by: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A maintenance window closed
    MaintenanceEnded {
        scope: String,
        duration_mins: i64,
        suppressed_alerts: i32,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Self-preservation
    // =========================================================================
    /// The engine handed itself (or its database) to the orchestrator for restart
    SelfRestartInitiated {
        handoff_id: String,
        target: String,
        reason: String,
        resumes_remediation: bool,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// The engine came back and resumed from the handoff
    SelfRestartCompleted {
        handoff_id: String,
        target: String,
        duration_secs: Option<i64>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Proactive monitoring
    // =========================================================================
    /// A predictive check found a problem before it alerted
    ProactiveFinding {
        check: String,
        target: String,
        finding: String,
        severity: Severity,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::RemediationSucceeded { alert_name, .. } => {
                format!("Alert Auto-Remediated: {alert_name}")
            }
            Self::RemediationFailed {
                alert_name,
                attempt_number,
                max_attempts,
                ..
            } => format!("Remediation Failed: {alert_name} ({attempt_number}/{max_attempts})"),
            Self::Escalation { alert_name, .. } => format!("Escalation: {alert_name}"),
            Self::UnsafePlan { alert_name, .. } => format!("Unsafe Plan Rejected: {alert_name}"),
            Self::HostOffline { host, .. } => format!("Host Offline: {host}"),
            Self::HostRecovered { host, .. } => format!("Host Recovered: {host}"),
            Self::SuppressionSummary { host, .. } => format!("Suppression Summary: {host}"),
            Self::MaintenanceStarted { scope, .. } => format!("Maintenance Started: {scope}"),
            Self::MaintenanceEnded { scope, .. } => format!("Maintenance Ended: {scope}"),
            Self::SelfRestartInitiated { target, .. } => format!("Self-Restart Initiated: {target}"),
            Self::SelfRestartCompleted { target, .. } => format!("Self-Restart Completed: {target}"),
            Self::ProactiveFinding { check, target, .. } => {
                format!("Proactive Finding: {check} on {target}")
            }
        }
    }

    /// Get the severity/color for this event.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::RemediationSucceeded { .. }
            | Self::HostRecovered { .. }
            | Self::MaintenanceStarted { .. }
            | Self::MaintenanceEnded { .. }
            | Self::SelfRestartCompleted { .. } => Severity::Info,

            Self::RemediationFailed { .. }
            | Self::SuppressionSummary { .. }
            | Self::SelfRestartInitiated { .. } => Severity::Warning,

            Self::Escalation { .. } | Self::UnsafePlan { .. } | Self::HostOffline { .. } => {
                Severity::Critical
            }

            Self::ProactiveFinding { severity, .. } => *severity,
        }
    }

    /// Get the timestamp of this event.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RemediationSucceeded { timestamp, .. }
            | Self::RemediationFailed { timestamp, .. }
            | Self::Escalation { timestamp, .. }
            | Self::UnsafePlan { timestamp, .. }
            | Self::HostOffline { timestamp, .. }
            | Self::HostRecovered { timestamp, .. }
            | Self::SuppressionSummary { timestamp, .. }
            | Self::MaintenanceStarted { timestamp, .. }
            | Self::MaintenanceEnded { timestamp, .. }
            | Self::SelfRestartInitiated { timestamp, .. }
            | Self::SelfRestartCompleted { timestamp, .. }
            | Self::ProactiveFinding { timestamp, .. } => *timestamp,
        }
    }
}
