//! Tool catalog and dispatch for the diagnosis loop.
//!
//! Every tool invocation validates parameter types and enumerated values
//! before any side effect; state-changing tools (`restart_service`,
//! `execute_safe_command`) additionally pass their command through the
//! blacklist validator. Tool outputs are truncated before they re-enter
//! model context. Optional tools (home automation, workflows) stay in the
//! catalog even when unconfigured and return a structured error, leaving it
//! to the model to route around them.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::llm::ToolDefinition;
use crate::clients::{LokiClient, PrometheusClient};
use crate::hosts::HostId;
use crate::ssh::{ServiceKind, SshExecutor};
use crate::validator::CommandValidator;
use crate::workflow::WorkflowClient;

/// Cap on log bytes returned into model context.
const MAX_TOOL_LOG_BYTES: usize = 2048;

/// Outcome of one tool dispatch: the JSON result for the model, plus the
/// shell command it implied (tracked so the final plan can reflect commands
/// already run through tools).
pub struct ToolOutcome {
    pub result: Value,
    pub executed_command: Option<String>,
}

impl ToolOutcome {
    fn ok(result: Value) -> Self {
        Self {
            result,
            executed_command: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            result: json!({"success": false, "error": message.into()}),
            executed_command: None,
        }
    }
}

/// Executes tool calls against the fleet.
pub struct ToolRouter {
    ssh: Arc<SshExecutor>,
    loki: LokiClient,
    prometheus: PrometheusClient,
    validator: CommandValidator,
    /// Supervisor token; its presence enables the home-automation tools
    home_automation_token: Option<String>,
    orchestrator: Option<Arc<WorkflowClient>>,
}

impl ToolRouter {
    #[must_use]
    pub fn new(
        ssh: Arc<SshExecutor>,
        loki: LokiClient,
        prometheus: PrometheusClient,
        home_automation_token: Option<String>,
        orchestrator: Option<Arc<WorkflowClient>>,
    ) -> Self {
        Self {
            ssh,
            loki,
            prometheus,
            validator: CommandValidator::new(),
            home_automation_token,
            orchestrator,
        }
    }

    /// The fixed tool catalog exposed to the model.
    #[must_use]
    pub fn catalog() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "gather_logs",
                description: "Gather recent logs from a system service to understand what's happening. Use this first to diagnose the issue.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "host": {"type": "string", "enum": ["forge", "haven", "outpost", "keep"],
                                 "description": "Which system to gather logs from"},
                        "kind": {"type": "string", "enum": ["docker", "systemd", "system"],
                                 "description": "Type of service (docker container, systemd service, or kernel log)"},
                        "name": {"type": "string",
                                 "description": "Name of the service or container (not needed for system logs)"},
                        "lines": {"type": "integer", "description": "Number of log lines to retrieve (default 100)"}
                    },
                    "required": ["host", "kind"]
                }),
            },
            ToolDefinition {
                name: "check_service_status",
                description: "Check if a service is running and get its current status.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "host": {"type": "string", "enum": ["forge", "haven", "outpost", "keep"]},
                        "name": {"type": "string", "description": "Name of the service or container"},
                        "kind": {"type": "string", "enum": ["docker", "systemd"],
                                 "description": "Type of service (default systemd)"}
                    },
                    "required": ["host", "name"]
                }),
            },
            ToolDefinition {
                name: "restart_service",
                description: "Restart a Docker container, systemd service, or the home automation core. A safe operation that often resolves issues.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "host": {"type": "string", "enum": ["forge", "haven", "outpost", "keep"]},
                        "kind": {"type": "string", "enum": ["docker", "systemd", "home-automation"],
                                 "description": "Type of service to restart"},
                        "name": {"type": "string",
                                 "description": "Name of the service or container (use 'core' for home automation)"}
                    },
                    "required": ["host", "kind", "name"]
                }),
            },
            ToolDefinition {
                name: "execute_safe_command",
                description: "Execute a validated safe command on a system. Only use this for read-only commands or well-known safe operations.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "host": {"type": "string", "enum": ["forge", "haven", "outpost", "keep"]},
                        "command": {"type": "string",
                                    "description": "The command to execute (validated against the safety blacklist)"}
                    },
                    "required": ["host", "command"]
                }),
            },
            ToolDefinition {
                name: "query_aggregated_logs",
                description: "Query aggregated logs from the log backend. Use this to find application-level errors, correlate events across services, or search for patterns without SSH.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "mode": {"type": "string", "enum": ["container_errors", "service_logs", "search"],
                                 "description": "container_errors (errors from one container), service_logs (all logs from a service), search (pattern search)"},
                        "target": {"type": "string",
                                   "description": "Container name, service name, or search pattern depending on mode"},
                        "minutes": {"type": "integer", "description": "How many minutes back to search (default 15)"}
                    },
                    "required": ["mode", "target"]
                }),
            },
            ToolDefinition {
                name: "query_metric_history",
                description: "Query the metrics backend for history and trends. Use to see if a problem is getting worse or to predict resource exhaustion (memory, disk, CPU).",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "metric": {"type": "string",
                                   "description": "Metric name (e.g. node_memory_MemAvailable_bytes, node_filesystem_avail_bytes)"},
                        "instance": {"type": "string",
                                     "description": "Target instance (e.g. 'forge:9100')"},
                        "hours": {"type": "integer", "description": "Hours of history (default 6)"},
                        "predict_exhaustion": {"type": "boolean",
                                               "description": "If true, predict when the metric hits zero"}
                    },
                    "required": ["metric", "instance"]
                }),
            },
            ToolDefinition {
                name: "restart_home_automation_addon",
                description: "Restart a home automation addon (zigbee2mqtt, mosquitto, matter, ...). Common names are resolved automatically.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "addon_slug": {"type": "string", "description": "Addon name or slug"}
                    },
                    "required": ["addon_slug"]
                }),
            },
            ToolDefinition {
                name: "reload_home_automations",
                description: "Reload all home automation automations. Use when automations are stuck or after YAML changes.",
                input_schema: json!({"type": "object", "properties": {}, "required": []}),
            },
            ToolDefinition {
                name: "get_home_automation_addon_info",
                description: "Get status and version info for a home automation addon.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "addon_slug": {"type": "string", "description": "Addon name or slug"}
                    },
                    "required": ["addon_slug"]
                }),
            },
            ToolDefinition {
                name: "execute_workflow",
                description: "Execute an orchestrator workflow for complex multi-step operations (database recovery, certificate renewal, docker cleanup).",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Workflow name"},
                        "data": {"type": "object", "description": "Optional input data"},
                        "wait": {"type": "boolean", "description": "Wait for completion (default true)"}
                    },
                    "required": ["name"]
                }),
            },
            ToolDefinition {
                name: "list_workflows",
                description: "List the orchestrator workflows available for complex operations.",
                input_schema: json!({"type": "object", "properties": {}, "required": []}),
            },
        ]
    }

    /// Execute one tool call.
    pub async fn dispatch(&self, tool_name: &str, input: &Value) -> ToolOutcome {
        info!(tool_name, tool_input = %input, "Executing tool");

        let Some(input_map) = input.as_object() else {
            return ToolOutcome::error("Invalid tool input: expected an object");
        };

        match tool_name {
            "gather_logs" => {
                let Some(host) = parse_host(input_map.get("host")) else {
                    return ToolOutcome::error("Invalid or missing 'host' parameter");
                };
                let Some(kind) = input_map
                    .get("kind")
                    .and_then(Value::as_str)
                    .and_then(ServiceKind::parse)
                else {
                    return ToolOutcome::error("Invalid or missing 'kind' parameter");
                };
                let name = input_map.get("name").and_then(Value::as_str);
                let lines = input_map
                    .get("lines")
                    .and_then(Value::as_u64)
                    .map_or(100, |n| n.min(1000) as u32);

                let logs = self.ssh.gather_logs(host, kind, name, lines).await;
                ToolOutcome::ok(json!({
                    "success": true,
                    "logs": truncate_bytes(&logs, MAX_TOOL_LOG_BYTES),
                }))
            }

            "check_service_status" => {
                let Some(host) = parse_host(input_map.get("host")) else {
                    return ToolOutcome::error("Invalid or missing 'host' parameter");
                };
                let Some(name) = input_map.get("name").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'name'");
                };
                let kind = input_map
                    .get("kind")
                    .and_then(Value::as_str)
                    .and_then(ServiceKind::parse)
                    .unwrap_or(ServiceKind::Systemd);

                let status = self.ssh.check_service_status(host, name, kind).await;
                ToolOutcome::ok(json!({"success": true, "status": status}))
            }

            "restart_service" => {
                let Some(host) = parse_host(input_map.get("host")) else {
                    return ToolOutcome::error("Invalid or missing 'host' parameter");
                };
                let Some(kind) = input_map
                    .get("kind")
                    .and_then(Value::as_str)
                    .and_then(ServiceKind::parse)
                else {
                    return ToolOutcome::error("Invalid or missing 'kind' parameter");
                };
                let Some(name) = input_map.get("name").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'name'");
                };

                let command = match kind {
                    ServiceKind::Docker => format!("docker restart {name}"),
                    ServiceKind::Systemd => format!("systemctl restart {name}"),
                    ServiceKind::HomeAutomation => "ha core restart".to_string(),
                    ServiceKind::System => {
                        return ToolOutcome::error("Cannot restart kind 'system'");
                    }
                };

                self.run_validated(host, &command).await
            }

            "execute_safe_command" => {
                let Some(host) = parse_host(input_map.get("host")) else {
                    return ToolOutcome::error("Invalid or missing 'host' parameter");
                };
                let Some(command) = input_map.get("command").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'command'");
                };

                self.run_validated(host, command).await
            }

            "query_aggregated_logs" => {
                let Some(mode) = input_map.get("mode").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'mode'");
                };
                let Some(target) = input_map.get("target").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'target'");
                };
                let minutes = input_map
                    .get("minutes")
                    .and_then(Value::as_i64)
                    .unwrap_or(15)
                    .clamp(1, 1440);

                let logs = match mode {
                    "container_errors" => self.loki.container_errors(target, minutes).await,
                    "service_logs" => self.loki.service_logs(target, minutes).await,
                    "search" => self.loki.search_logs(target, minutes).await,
                    other => return ToolOutcome::error(format!("Unknown mode: {other}")),
                };

                ToolOutcome::ok(json!({
                    "success": true,
                    "logs": truncate_bytes(&logs, MAX_TOOL_LOG_BYTES),
                }))
            }

            "query_metric_history" => {
                let Some(metric) = input_map.get("metric").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'metric'");
                };
                let Some(instance) = input_map.get("instance").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'instance'");
                };
                let hours = input_map
                    .get("hours")
                    .and_then(Value::as_i64)
                    .unwrap_or(6)
                    .clamp(1, 168);
                let predict = input_map
                    .get("predict_exhaustion")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                let trend = match self.prometheus.metric_trend(metric, instance, hours).await {
                    Ok(trend) => trend,
                    Err(e) => return ToolOutcome::error(format!("Metrics query failed: {e}")),
                };

                let mut result = json!({"success": true, "trend": trend});
                if predict {
                    match self.prometheus.predict_exhaustion(metric, instance, 0.0).await {
                        Ok(prediction) => {
                            result["exhaustion_prediction"] =
                                serde_json::to_value(prediction).unwrap_or(Value::Null);
                        }
                        Err(e) => {
                            result["exhaustion_prediction"] =
                                json!({"error": format!("prediction failed: {e}")});
                        }
                    }
                }
                ToolOutcome::ok(result)
            }

            "restart_home_automation_addon" => {
                if self.home_automation_token.is_none() {
                    return ToolOutcome::error(
                        "Home automation integration not configured (HA_TOKEN not set)",
                    );
                }
                let Some(slug) = input_map.get("addon_slug").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'addon_slug'");
                };
                let slug = resolve_addon_slug(slug);
                self.run_validated(HostId::Haven, &format!("ha addons restart {slug}"))
                    .await
            }

            "reload_home_automations" => {
                let Some(token) = &self.home_automation_token else {
                    return ToolOutcome::error(
                        "Home automation integration not configured (HA_TOKEN not set)",
                    );
                };
                // The reload service is only reachable through the core API.
                self.run_validated(
                    HostId::Haven,
                    &format!(
                        "curl -sf -X POST -H 'Authorization: Bearer {token}' http://localhost:8123/api/services/automation/reload"
                    ),
                )
                .await
            }

            "get_home_automation_addon_info" => {
                if self.home_automation_token.is_none() {
                    return ToolOutcome::error(
                        "Home automation integration not configured (HA_TOKEN not set)",
                    );
                }
                let Some(slug) = input_map.get("addon_slug").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'addon_slug'");
                };
                let slug = resolve_addon_slug(slug);
                let info = self
                    .ssh
                    .execute_command(HostId::Haven, &format!("ha addons info {slug}"), None)
                    .await;
                ToolOutcome::ok(json!({
                    "success": info.2 == 0,
                    "info": truncate_bytes(&info.0, MAX_TOOL_LOG_BYTES),
                    "error": if info.2 == 0 { Value::Null } else { json!(info.1) },
                }))
            }

            "execute_workflow" => {
                let Some(orchestrator) = &self.orchestrator else {
                    return ToolOutcome::error(
                        "Workflow orchestrator not configured (ORCHESTRATOR_URL not set)",
                    );
                };
                let Some(name) = input_map.get("name").and_then(Value::as_str) else {
                    return ToolOutcome::error("Missing required parameter 'name'");
                };
                let data = input_map.get("data").cloned().unwrap_or(json!({}));

                match orchestrator.run_workflow(name, &data).await {
                    Ok(result) => ToolOutcome::ok(json!({"success": true, "result": result})),
                    Err(e) => ToolOutcome::error(format!("Workflow execution failed: {e}")),
                }
            }

            "list_workflows" => {
                let Some(orchestrator) = &self.orchestrator else {
                    return ToolOutcome::error(
                        "Workflow orchestrator not configured (ORCHESTRATOR_URL not set)",
                    );
                };
                match orchestrator.list_workflows().await {
                    Ok(workflows) => {
                        ToolOutcome::ok(json!({"success": true, "workflows": workflows}))
                    }
                    Err(e) => ToolOutcome::error(format!("Workflow list failed: {e}")),
                }
            }

            other => ToolOutcome::error(format!("Unknown tool: {other}")),
        }
    }

    /// Validate then execute one command, recording it for plan tracking.
    async fn run_validated(&self, host: HostId, command: &str) -> ToolOutcome {
        let (safe, _, reason) = self.validator.validate_command(command);
        if !safe {
            warn!(command, reason, "Tool command refused by validator");
            return ToolOutcome::error(format!("Command rejected: {reason}"));
        }

        let result = self
            .ssh
            .execute_commands(host, &[command.to_string()], None)
            .await;

        ToolOutcome {
            result: json!({
                "success": result.success,
                "output": truncate_bytes(
                    result.outputs.first().map_or("", String::as_str),
                    MAX_TOOL_LOG_BYTES,
                ),
                "exit_code": result.exit_codes.first().copied().unwrap_or(-1),
            }),
            executed_command: Some(command.to_string()),
        }
    }
}

fn parse_host(value: Option<&Value>) -> Option<HostId> {
    value.and_then(Value::as_str).and_then(HostId::parse)
}

/// Resolve common addon names to their canonical slugs.
fn resolve_addon_slug(name: &str) -> String {
    match name.to_lowercase().as_str() {
        "mqtt" | "mosquitto" => "core_mosquitto".to_string(),
        "zigbee2mqtt" | "z2m" => "zigbee2mqtt".to_string(),
        other => other.to_string(),
    }
}

fn truncate_bytes(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...(truncated)", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::hosts::HostMonitor;
    use crate::store::Store;
    use notify::Notifier;
    use std::collections::HashMap;
    use std::time::Duration;

    fn router() -> ToolRouter {
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
        let ssh = Arc::new(SshExecutor::new(
            configs,
            Duration::from_secs(1),
            Duration::from_secs(5),
            monitor,
        ));
        ToolRouter::new(
            ssh,
            LokiClient::with_base_url("http://127.0.0.1:1"),
            PrometheusClient::with_base_url("http://127.0.0.1:1"),
            None,
            None,
        )
    }

    #[test]
    fn test_catalog_names_are_unique_and_complete() {
        let catalog = ToolRouter::catalog();
        let names: Vec<&str> = catalog.iter().map(|t| t.name).collect();

        for required in [
            "gather_logs",
            "check_service_status",
            "restart_service",
            "execute_safe_command",
            "query_aggregated_logs",
            "query_metric_history",
        ] {
            assert!(names.contains(&required), "missing tool {required}");
        }

        let unique: std::collections::HashSet<&&str> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_bad_host() {
        let outcome = router()
            .dispatch(
                "gather_logs",
                &json!({"host": "mainframe", "kind": "docker"}),
            )
            .await;
        assert_eq!(outcome.result["success"], false);
        assert!(outcome.result["error"]
            .as_str()
            .unwrap()
            .contains("host"));
    }

    #[tokio::test]
    async fn test_dispatch_rejects_bad_kind() {
        let outcome = router()
            .dispatch("gather_logs", &json!({"host": "keep", "kind": "magic"}))
            .await;
        assert_eq!(outcome.result["success"], false);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let outcome = router().dispatch("open_pod_bay_doors", &json!({})).await;
        assert_eq!(outcome.result["success"], false);
        assert!(outcome.result["error"]
            .as_str()
            .unwrap()
            .contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_execute_safe_command_flows_through_validator() {
        let outcome = router()
            .dispatch(
                "execute_safe_command",
                &json!({"host": "keep", "command": "rm -rf /var"}),
            )
            .await;
        assert_eq!(outcome.result["success"], false);
        assert!(outcome.result["error"]
            .as_str()
            .unwrap()
            .contains("rejected"));
        assert!(outcome.executed_command.is_none());
    }

    #[tokio::test]
    async fn test_execute_safe_command_records_command() {
        let outcome = router()
            .dispatch(
                "execute_safe_command",
                &json!({"host": "keep", "command": "echo diagnostics"}),
            )
            .await;
        assert_eq!(outcome.result["success"], true);
        assert_eq!(outcome.executed_command.as_deref(), Some("echo diagnostics"));
    }

    #[tokio::test]
    async fn test_disabled_home_automation_tool_errors() {
        let outcome = router()
            .dispatch(
                "restart_home_automation_addon",
                &json!({"addon_slug": "zigbee2mqtt"}),
            )
            .await;
        assert_eq!(outcome.result["success"], false);
        assert!(outcome.result["error"]
            .as_str()
            .unwrap()
            .contains("not configured"));
    }

    #[test]
    fn test_addon_slug_resolution() {
        assert_eq!(resolve_addon_slug("mqtt"), "core_mosquitto");
        assert_eq!(resolve_addon_slug("Mosquitto"), "core_mosquitto");
        assert_eq!(resolve_addon_slug("zigbee2mqtt"), "zigbee2mqtt");
        assert_eq!(resolve_addon_slug("custom_addon"), "custom_addon");
    }

    #[test]
    fn test_truncate_bytes() {
        let long = "y".repeat(4096);
        let out = truncate_bytes(&long, MAX_TOOL_LOG_BYTES);
        assert!(out.len() < 4096);
        assert!(out.ends_with("...(truncated)"));
    }
}
