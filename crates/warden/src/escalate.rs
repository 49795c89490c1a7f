//! Escalation to humans when automation is exhausted.
//!
//! Every escalation writes an escalation-only marker row (escalated, no
//! commands - excluded from the attempt counter). The chat notification is
//! gated by a per-identity cooldown so a stuck alert cannot spam the channel;
//! inside the cooldown the marker is still written, silently. The cooldown
//! is only set once a notification actually went out.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::queue::AlertQueue;
use crate::store::{RemediationAttempt, Store};
use crate::validator::RiskLevel;
use notify::{AttemptSummary, Notifier, NotifyEvent};

/// Prior attempts summarized in the escalation message.
const ESCALATION_CONTEXT_ATTEMPTS: i64 = 3;

/// Cooldown-gated escalation notifier.
pub struct Escalator {
    store: Arc<Store>,
    queue: Arc<AlertQueue>,
    notifier: Arc<Notifier>,
    cooldown_hours: i64,
}

impl Escalator {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        queue: Arc<AlertQueue>,
        notifier: Arc<Notifier>,
        cooldown_hours: i64,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            cooldown_hours,
        }
    }

    /// Escalate an alert after `attempt_count` exhausted attempts.
    ///
    /// Returns whether a notification was sent (false inside the cooldown).
    pub async fn escalate(
        &self,
        alert_name: &str,
        alert_instance: &str,
        alert_fingerprint: &str,
        severity: &str,
        attempt_count: i64,
        last_reasoning: Option<&str>,
    ) -> bool {
        let in_cooldown = match self
            .store
            .check_escalation_cooldown(alert_name, alert_instance, self.cooldown_hours)
            .await
        {
            Ok(Some(escalated_at)) => {
                info!(
                    alert_name,
                    alert_instance,
                    %escalated_at,
                    cooldown_hours = self.cooldown_hours,
                    "Escalation notification suppressed by cooldown"
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                // Best-effort gate; a broken cooldown check must not block
                // the escalation itself.
                warn!(error = %e, "Escalation cooldown check failed, notifying anyway");
                false
            }
        };

        // The marker row is written in either case: the record of "automation
        // gave up here" must survive even when the channel stays quiet.
        let mut marker = RemediationAttempt::new(
            alert_name,
            alert_instance,
            alert_fingerprint,
            severity,
            i32::try_from(attempt_count).unwrap_or(i32::MAX),
        );
        marker.ai_analysis = Some(format!(
            "Alert escalated after {attempt_count} failed attempts"
        ));
        marker.escalated = true;
        marker.risk_level = Some(RiskLevel::High);
        self.queue.persist_or_queue(marker).await;

        if in_cooldown {
            return false;
        }

        info!(alert_name, attempts = attempt_count, "Escalating alert");

        let previous = self
            .store
            .get_recent_attempts(alert_name, alert_instance, ESCALATION_CONTEXT_ATTEMPTS)
            .await
            .unwrap_or_default();

        let previous_attempts: Vec<AttemptSummary> = previous
            .iter()
            .map(|row| AttemptSummary {
                attempt_number: row.attempt_number,
                commands: row.commands_executed.clone(),
                success: row.success,
                error: row.error_message.clone(),
            })
            .collect();

        let event = NotifyEvent::Escalation {
            alert_name: alert_name.to_string(),
            alert_instance: alert_instance.to_string(),
            attempts: i32::try_from(attempt_count).unwrap_or(i32::MAX),
            last_reasoning: last_reasoning.map(ToString::to_string),
            previous_attempts,
            timestamp: Utc::now(),
        };

        let results = self.notifier.notify_and_wait(event).await;
        let delivered = results.is_empty() || results.iter().any(|(_, r)| r.is_ok());

        if delivered {
            // Refresh the cooldown only on actual delivery so a failed
            // webhook does not silence the next escalation.
            self.store
                .set_escalation_cooldown(alert_name, alert_instance)
                .await;
        } else {
            warn!(alert_name, "Escalation notification failed on all channels");
        }

        delivered
    }
}
