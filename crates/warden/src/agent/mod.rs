//! The diagnosis loop.
//!
//! Sends the alert plus system context (and optionally a runbook and a
//! medium-confidence learned pattern) to the model with the tool catalog,
//! executes tool calls as they come back, and parses the final message into
//! a [`Analysis`]. The loop is capped at five iterations; hitting the cap or
//! failing to parse yields a HIGH-risk placeholder that the pipeline
//! escalates.

pub mod llm;
pub mod tools;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::EngineResult;
use crate::validator::RiskLevel;
use llm::{ContentBlock, LlmClient, Message};
use tools::ToolRouter;

/// Hard cap on model/tool round-trips per alert.
const MAX_ITERATIONS: usize = 5;

/// Context about one alert, as handed to the model.
#[derive(Debug, Clone, Serialize)]
pub struct AlertContext {
    pub alert_name: String,
    pub alert_instance: String,
    pub severity: String,
    pub description: String,
}

/// The model's final remediation analysis.
#[derive(Debug, Clone, Deserialize)]
pub struct Analysis {
    #[serde(default = "default_analysis_text")]
    pub analysis: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default = "default_risk", deserialize_with = "deserialize_risk")]
    pub risk: RiskLevel,
    #[serde(default)]
    pub expected_outcome: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default = "default_duration")]
    pub estimated_duration: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Host where commands should run when it differs from the alert instance
    #[serde(default)]
    pub target_host: Option<String>,
    #[serde(default)]
    pub instance_label_misleading: bool,
    #[serde(default)]
    pub investigation_steps: Vec<serde_json::Value>,
}

fn default_analysis_text() -> String {
    "No analysis provided".to_string()
}

fn default_risk() -> RiskLevel {
    RiskLevel::High
}

fn default_duration() -> String {
    "unknown".to_string()
}

fn deserialize_risk<'de, D>(deserializer: D) -> Result<RiskLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(RiskLevel::parse(&raw))
}

impl Analysis {
    /// The fallback produced when the loop cannot complete.
    #[must_use]
    pub fn incomplete(reason: &str, executed_commands: Vec<String>) -> Self {
        Self {
            analysis: format!("Analysis incomplete - {reason}"),
            commands: executed_commands,
            risk: RiskLevel::High,
            expected_outcome: "Manual intervention required".to_string(),
            reasoning: reason.to_string(),
            estimated_duration: "unknown".to_string(),
            confidence: None,
            target_host: None,
            instance_label_misleading: false,
            investigation_steps: vec![],
        }
    }
}

static JSON_OBJECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[\s\S]*\}").expect("json object pattern"));

/// Runs the tool-use loop against the model.
pub struct RemediationAgent {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRouter>,
}

impl RemediationAgent {
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolRouter>) -> Self {
        Self { llm, tools }
    }

    /// Diagnose an alert and produce a remediation plan.
    ///
    /// `system_context` carries the fleet description, correlation context,
    /// and any medium-confidence pattern; `runbook_context` is the parsed
    /// runbook for this alert type when one exists.
    pub async fn analyze_alert(
        &self,
        alert: &AlertContext,
        system_context: &str,
        runbook_context: Option<&str>,
    ) -> EngineResult<Analysis> {
        let system_prompt = build_system_prompt();
        let user_prompt = build_user_prompt(alert, system_context, runbook_context);

        let mut messages = vec![Message::user_text(&user_prompt)];
        let catalog = ToolRouter::catalog();
        let mut executed_commands: Vec<String> = Vec::new();

        info!(
            alert_name = %alert.alert_name,
            alert_instance = %alert.alert_instance,
            "Starting model analysis"
        );

        for iteration in 1..=MAX_ITERATIONS {
            let response = self
                .llm
                .tool_round(&system_prompt, &messages, &catalog)
                .await?;

            info!(
                stop_reason = response.stop_reason.as_deref().unwrap_or("none"),
                iteration,
                "Model response received"
            );

            match response.stop_reason.as_deref() {
                Some("tool_use") => {
                    let mut tool_results = Vec::new();

                    for (id, name, input) in response.tool_uses() {
                        let outcome = self.tools.dispatch(name, input).await;
                        if let Some(command) = outcome.executed_command {
                            executed_commands.push(command);
                        }
                        tool_results.push(ContentBlock::ToolResult {
                            tool_use_id: id.to_string(),
                            content: outcome.result.to_string(),
                        });
                    }

                    messages.push(Message::assistant(response.content.clone()));
                    messages.push(Message::tool_results(tool_results));
                }

                Some("end_turn") => {
                    let mut analysis = parse_analysis(&response.text());

                    // Commands already executed through tools stand in for an
                    // empty plan: the model fixed it mid-loop.
                    if analysis.commands.is_empty() && !executed_commands.is_empty() {
                        analysis.commands.clone_from(&executed_commands);
                    }

                    info!(
                        alert_name = %alert.alert_name,
                        risk = analysis.risk.as_str(),
                        command_count = analysis.commands.len(),
                        "Model analysis completed"
                    );
                    return Ok(analysis);
                }

                other => {
                    warn!(stop_reason = ?other, "Unexpected stop reason");
                    break;
                }
            }
        }

        warn!(iterations = MAX_ITERATIONS, "Model iteration cap reached");
        Ok(Analysis::incomplete(
            "max iterations reached",
            executed_commands,
        ))
    }
}

fn build_system_prompt() -> String {
    r#"You are an SRE agent managing a small homelab fleet. You receive alerts from the monitoring stack and must diagnose and fix issues.

You have tools to gather logs, check service status, restart services, and run safe commands. Use them to:

1. First, gather logs to understand what's happening
2. Check service status if needed
3. Based on your analysis, restart services or execute safe commands to fix the issue

After using tools to diagnose and attempt remediation, provide your final analysis in this exact JSON format:

{
  "analysis": "Brief root cause analysis based on what you found",
  "commands": ["command1", "command2"],
  "risk": "low|medium|high",
  "expected_outcome": "What should happen after executing these commands",
  "reasoning": "Why these commands will resolve the issue",
  "estimated_duration": "30 seconds"
}

SAFETY CONSTRAINTS:
- Only use systemctl restart, docker restart, basic service management
- DO NOT suggest: reboots, data deletion, firewall changes, file edits
- If the issue requires human intervention, set risk="high"
- Commands must be idempotent (safe to run multiple times)

The commands you list should reflect what you've already done via tools, or what should be done if you haven't used tools yet."#
        .to_string()
}

fn build_user_prompt(
    alert: &AlertContext,
    system_context: &str,
    runbook_context: Option<&str>,
) -> String {
    let runbook_section = runbook_context
        .map(|r| format!("\n{r}"))
        .unwrap_or_default();

    format!(
        r"# Alert Details
- **Alert Name:** {name}
- **Instance:** {instance}
- **Severity:** {severity}
- **Description:** {description}

{system_context}
{runbook_section}

Please diagnose this alert and attempt remediation. Use your tools first, then provide your final analysis.",
        name = alert.alert_name,
        instance = alert.alert_instance,
        severity = alert.severity,
        description = alert.description,
    )
}

/// Parse the final analysis out of free text. The model is asked for a bare
/// JSON object but routinely wraps it in prose; grab the outermost object
/// and fall back to a HIGH-risk placeholder when nothing parses.
#[must_use]
pub fn parse_analysis(text: &str) -> Analysis {
    if let Some(json_match) = JSON_OBJECT_RE.find(text) {
        match serde_json::from_str::<Analysis>(json_match.as_str()) {
            Ok(analysis) => return analysis,
            Err(e) => {
                error!(
                    error = %e,
                    text = &text[..text.len().min(500)],
                    "Analysis parsing failed"
                );
            }
        }
    }

    Analysis {
        analysis: "Failed to parse analysis from response".to_string(),
        commands: vec![],
        risk: RiskLevel::High,
        expected_outcome: "Manual review required".to_string(),
        reasoning: text.chars().take(500).collect(),
        estimated_duration: "unknown".to_string(),
        confidence: None,
        target_host: None,
        instance_label_misleading: false,
        investigation_steps: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::hosts::{HostId, HostMonitor};
    use crate::store::Store;
    use async_trait::async_trait;
    use notify::Notifier;
    use super::llm::{LlmResponse, ToolDefinition};
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    /// Plays back a fixed sequence of model responses.
    struct ScriptedLlm {
        responses: std::sync::Mutex<VecDeque<LlmResponse>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<serde_json::Value>) -> Self {
            Self {
                responses: std::sync::Mutex::new(
                    responses
                        .into_iter()
                        .map(|v| serde_json::from_value(v).expect("scripted response"))
                        .collect(),
                ),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn tool_round(
            &self,
            _system: &str,
            _messages: &[Message],
            _tools: &[ToolDefinition],
        ) -> crate::error::EngineResult<LlmResponse> {
            self.responses
                .lock()
                .expect("scripted responses")
                .pop_front()
                .ok_or_else(|| {
                    crate::error::EngineError::Permanent("script exhausted".to_string())
                })
        }
    }

    fn tool_router() -> Arc<ToolRouter> {
        let mut configs = HashMap::new();
        configs.insert(
            HostId::Keep,
            HostConfig {
                address: "localhost".to_string(),
                user: "root".to_string(),
                key_path: "/tmp/none".to_string(),
            },
        );
        let monitor = Arc::new(HostMonitor::new(
            Arc::new(Store::disconnected()),
            Arc::new(Notifier::disabled()),
            HashMap::new(),
        ));
        let ssh = Arc::new(crate::ssh::SshExecutor::new(
            configs,
            Duration::from_secs(1),
            Duration::from_secs(5),
            monitor,
        ));
        Arc::new(ToolRouter::new(
            ssh,
            crate::clients::LokiClient::with_base_url("http://127.0.0.1:1"),
            crate::clients::PrometheusClient::with_base_url("http://127.0.0.1:1"),
            None,
            None,
        ))
    }

    fn alert_context() -> AlertContext {
        AlertContext {
            alert_name: "ContainerUnhealthy".to_string(),
            alert_instance: "keep:9323".to_string(),
            severity: "warning".to_string(),
            description: "caddy is unhealthy".to_string(),
        }
    }

    #[tokio::test]
    async fn test_loop_executes_tools_then_returns_analysis() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            serde_json::json!({
                "stop_reason": "tool_use",
                "content": [{
                    "type": "tool_use", "id": "tu_1", "name": "execute_safe_command",
                    "input": {"host": "keep", "command": "echo probe"}
                }]
            }),
            serde_json::json!({
                "stop_reason": "end_turn",
                "content": [{
                    "type": "text",
                    "text": r#"{"analysis": "healthy after probe", "commands": [],
                                "risk": "low", "expected_outcome": "ok", "reasoning": "probe ran"}"#
                }]
            }),
        ]));

        let agent = RemediationAgent::new(llm, tool_router());
        let analysis = agent
            .analyze_alert(&alert_context(), "fleet context", None)
            .await
            .unwrap();

        assert_eq!(analysis.risk, RiskLevel::Low);
        // The empty plan is backfilled with the command run through tools.
        assert_eq!(analysis.commands, vec!["echo probe"]);
    }

    #[tokio::test]
    async fn test_loop_cap_yields_high_risk_fallback() {
        let tool_round = serde_json::json!({
            "stop_reason": "tool_use",
            "content": [{
                "type": "tool_use", "id": "tu_1", "name": "check_service_status",
                "input": {"host": "keep", "name": "caddy", "kind": "docker"}
            }]
        });
        // Never reaches end_turn: five tool rounds exhaust the cap.
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_round.clone(),
            tool_round.clone(),
            tool_round.clone(),
            tool_round.clone(),
            tool_round,
        ]));

        let agent = RemediationAgent::new(llm, tool_router());
        let analysis = agent
            .analyze_alert(&alert_context(), "fleet context", None)
            .await
            .unwrap();

        assert_eq!(analysis.risk, RiskLevel::High);
        assert!(analysis.analysis.contains("incomplete"));
    }

    #[test]
    fn test_parse_analysis_plain_json() {
        let text = r#"{"analysis": "caddy wedged", "commands": ["docker restart caddy"],
                       "risk": "low", "expected_outcome": "container healthy",
                       "reasoning": "restart clears it", "estimated_duration": "15 seconds"}"#;
        let analysis = parse_analysis(text);
        assert_eq!(analysis.analysis, "caddy wedged");
        assert_eq!(analysis.commands, vec!["docker restart caddy"]);
        assert_eq!(analysis.risk, RiskLevel::Low);
    }

    #[test]
    fn test_parse_analysis_wrapped_in_prose() {
        let text = r#"Based on the logs, here is my analysis:

{"analysis": "disk filled by old logs", "commands": ["docker system prune -f"], "risk": "medium",
 "expected_outcome": "space reclaimed", "reasoning": "prune removes dangling layers"}

Let me know if you need anything else."#;
        let analysis = parse_analysis(text);
        assert_eq!(analysis.risk, RiskLevel::Medium);
        assert_eq!(analysis.commands.len(), 1);
    }

    #[test]
    fn test_parse_analysis_garbage_falls_back_high() {
        let analysis = parse_analysis("I could not figure this one out, sorry.");
        assert_eq!(analysis.risk, RiskLevel::High);
        assert!(analysis.commands.is_empty());
        assert!(analysis.reasoning.contains("could not figure"));
    }

    #[test]
    fn test_parse_analysis_unknown_risk_is_high() {
        let text = r#"{"analysis": "x", "commands": [], "risk": "catastrophic",
                       "expected_outcome": "y", "reasoning": "z"}"#;
        let analysis = parse_analysis(text);
        assert_eq!(analysis.risk, RiskLevel::High);
    }

    #[test]
    fn test_parse_analysis_optional_fields() {
        let text = r#"{"analysis": "x", "commands": ["docker restart n8n"], "risk": "low",
                       "expected_outcome": "y", "reasoning": "z",
                       "target_host": "outpost", "instance_label_misleading": true,
                       "confidence": 0.8}"#;
        let analysis = parse_analysis(text);
        assert_eq!(analysis.target_host.as_deref(), Some("outpost"));
        assert!(analysis.instance_label_misleading);
        assert!((analysis.confidence.unwrap() - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_incomplete_fallback_carries_executed_commands() {
        let analysis =
            Analysis::incomplete("max iterations reached", vec!["docker restart x".into()]);
        assert_eq!(analysis.risk, RiskLevel::High);
        assert_eq!(analysis.commands, vec!["docker restart x"]);
    }
}
