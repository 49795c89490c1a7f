//! Discord webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for the Discord webhook URL.
const ENV_DISCORD_WEBHOOK_URL: &str = "DISCORD_WEBHOOK_URL";

/// Discord truncates embed field values at 1024 characters.
const MAX_FIELD_LEN: usize = 1000;

/// Discord webhook notification channel.
pub struct DiscordChannel {
    webhook_url: Option<String>,
    username: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct DiscordPayload {
    username: String,
    embeds: Vec<DiscordEmbed>,
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
    fields: Vec<DiscordField>,
    timestamp: String,
    footer: DiscordFooter,
}

#[derive(Debug, Serialize)]
struct DiscordField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Debug, Serialize)]
struct DiscordFooter {
    text: String,
}

impl DiscordChannel {
    /// Create a new Discord channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_DISCORD_WEBHOOK_URL).ok();

        if webhook_url.is_some() {
            debug!("Discord notifications enabled");
        } else {
            debug!("Discord notifications disabled (DISCORD_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            username: "Warden".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a Discord channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            username: "Warden".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Format an event as a Discord webhook payload.
    fn format_payload(&self, event: &NotifyEvent) -> DiscordPayload {
        let mut fields = vec![];

        match event {
            NotifyEvent::RemediationSucceeded {
                alert_instance,
                attempt_number,
                max_attempts,
                duration_secs,
                analysis,
                commands,
                ..
            } => {
                fields.push(field("Instance", alert_instance, true));
                fields.push(field(
                    "Attempt",
                    &format!("{attempt_number}/{max_attempts}"),
                    true,
                ));
                fields.push(field("Duration", &format!("{duration_secs}s"), true));
                fields.push(field("Analysis", analysis, false));
                fields.push(field(
                    "Commands",
                    &format!("```bash\n{}\n```", commands.join("\n")),
                    false,
                ));
            }

            NotifyEvent::RemediationFailed {
                alert_instance,
                error,
                commands,
                ..
            } => {
                fields.push(field("Instance", alert_instance, true));
                fields.push(field("Error", error, false));
                if !commands.is_empty() {
                    fields.push(field(
                        "Commands",
                        &format!("```bash\n{}\n```", commands.join("\n")),
                        false,
                    ));
                }
            }

            NotifyEvent::Escalation {
                alert_instance,
                attempts,
                last_reasoning,
                previous_attempts,
                ..
            } => {
                fields.push(field("Instance", alert_instance, true));
                fields.push(field("Attempts", &attempts.to_string(), true));
                if let Some(reasoning) = last_reasoning {
                    fields.push(field("Last Reasoning", reasoning, false));
                }
                for prior in previous_attempts {
                    let outcome = if prior.success { "ok" } else { "failed" };
                    let detail = match &prior.error {
                        Some(e) => format!("{} ({outcome}: {e})", prior.commands.join("; ")),
                        None => format!("{} ({outcome})", prior.commands.join("; ")),
                    };
                    fields.push(field(
                        &format!("Attempt {}", prior.attempt_number),
                        &detail,
                        false,
                    ));
                }
            }

            NotifyEvent::UnsafePlan {
                alert_instance,
                rejected_commands,
                reasons,
                ..
            } => {
                fields.push(field("Instance", alert_instance, true));
                fields.push(field(
                    "Rejected",
                    &format!("```bash\n{}\n```", rejected_commands.join("\n")),
                    false,
                ));
                fields.push(field("Reasons", &reasons.join("\n"), false));
            }

            NotifyEvent::HostOffline {
                failure_count,
                error,
                ..
            } => {
                fields.push(field(
                    "Failures",
                    &format!("{failure_count} consecutive attempts"),
                    true,
                ));
                fields.push(field(
                    "Error",
                    error.as_deref().unwrap_or("Connection timeout"),
                    false,
                ));
                fields.push(field(
                    "Impact",
                    "Alerts for this host are suppressed; recovery check every 5 minutes",
                    false,
                ));
            }

            NotifyEvent::HostRecovered { downtime_secs, .. } => {
                if let Some(secs) = downtime_secs {
                    fields.push(field("Downtime", &format_duration(*secs), true));
                }
                fields.push(field("Status", "Resuming normal alert processing", false));
            }

            NotifyEvent::SuppressionSummary {
                suppressed_count,
                critical_count,
                warning_count,
                alert_names,
                ..
            } => {
                fields.push(field("Total Suppressed", &suppressed_count.to_string(), true));
                fields.push(field(
                    "Breakdown",
                    &format!("{critical_count} critical / {warning_count} warning"),
                    true,
                ));
                fields.push(field("Alert Types", &alert_names.join(", "), false));
            }

            NotifyEvent::MaintenanceStarted {
                reason, created_by, ..
            } => {
                fields.push(field("Reason", reason, false));
                fields.push(field("Started By", created_by, true));
                fields.push(field(
                    "Impact",
                    "Alert remediation is paused; alerts will be suppressed and logged",
                    false,
                ));
            }

            NotifyEvent::MaintenanceEnded {
                duration_mins,
                suppressed_alerts,
                ..
            } => {
                fields.push(field("Duration", &format!("{duration_mins} minutes"), true));
                fields.push(field(
                    "Alerts Suppressed",
                    &suppressed_alerts.to_string(),
                    true,
                ));
            }

            NotifyEvent::SelfRestartInitiated {
                handoff_id,
                reason,
                resumes_remediation,
                ..
            } => {
                fields.push(field("Handoff", &format!("`{handoff_id}`"), true));
                fields.push(field("Reason", reason, false));
                if *resumes_remediation {
                    fields.push(field(
                        "Note",
                        "In-flight remediation will resume after restart",
                        false,
                    ));
                }
            }

            NotifyEvent::SelfRestartCompleted {
                handoff_id,
                duration_secs,
                ..
            } => {
                fields.push(field("Handoff", &format!("`{handoff_id}`"), true));
                if let Some(secs) = duration_secs {
                    fields.push(field("Duration", &format!("{secs}s"), true));
                }
            }

            NotifyEvent::ProactiveFinding { finding, .. } => {
                fields.push(field("Finding", finding, false));
            }
        }

        DiscordPayload {
            username: self.username.clone(),
            embeds: vec![DiscordEmbed {
                title: event.title(),
                description: String::new(),
                color: event.severity().color(),
                fields,
                timestamp: event.timestamp().to_rfc3339(),
                footer: DiscordFooter {
                    text: "Warden".to_string(),
                },
            }],
        }
    }
}

fn field(name: &str, value: &str, inline: bool) -> DiscordField {
    let mut value = value.to_string();
    if value.len() > MAX_FIELD_LEN {
        value.truncate(MAX_FIELD_LEN);
        value.push('…');
    }
    if value.is_empty() {
        value.push('-');
    }
    DiscordField {
        name: name.to_string(),
        value,
        inline,
    }
}

fn format_duration(total_seconds: i64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    let mut parts = vec![];
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{seconds}s"));
    }
    parts.join(" ")
}

#[async_trait]
impl NotifyChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let Some(url) = &self.webhook_url else {
            return Err(ChannelError::NotConfigured(
                "DISCORD_WEBHOOK_URL not set".to_string(),
            ));
        };

        let payload = self.format_payload(event);

        let response = self
            .client
            .post(url)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(event = %event.title(), "Discord notification sent");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ChannelError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_field_truncation() {
        let long = "x".repeat(5000);
        let f = field("Output", &long, false);
        assert!(f.value.len() <= MAX_FIELD_LEN + '…'.len_utf8());
        assert!(f.value.ends_with('…'));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(61), "1m 1s");
        assert_eq!(format_duration(3661), "1h 1m 1s");
        assert_eq!(format_duration(3600), "1h");
    }

    #[test]
    fn test_payload_has_embed() {
        let channel = DiscordChannel::new("http://localhost/webhook".to_string());
        let event = NotifyEvent::RemediationSucceeded {
            alert_name: "ContainerUnhealthy".to_string(),
            alert_instance: "forge:9323".to_string(),
            attempt_number: 1,
            max_attempts: 3,
            duration_secs: 12,
            analysis: "Container wedged after OOM".to_string(),
            commands: vec!["docker restart caddy".to_string()],
            timestamp: Utc::now(),
        };

        let payload = channel.format_payload(&event);
        assert_eq!(payload.embeds.len(), 1);
        assert!(payload.embeds[0].title.contains("ContainerUnhealthy"));
        assert!(payload.embeds[0]
            .fields
            .iter()
            .any(|f| f.value.contains("docker restart caddy")));
    }
}
