//! HTTP surface: the Alertmanager webhook, the self-preservation resume
//! callback, and the operational endpoints (health, metrics, maintenance,
//! patterns, analytics, runbooks, statistics).
//!
//! Write endpoints sit behind HTTP Basic auth. The `/resume` callback is
//! instead guarded by the handoff id itself: only an existing non-terminal
//! handoff can be resumed, and the id is generated per handoff.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::alerts::AlertmanagerPayload;
use crate::clients::{LokiClient, PrometheusClient};
use crate::config::Config;
use crate::hosts::HostMonitor;
use crate::learning::LearningEngine;
use crate::metrics;
use crate::pipeline::Pipeline;
use crate::preservation::PreservationManager;
use crate::queue::AlertQueue;
use crate::runbooks::RunbookManager;
use crate::store::Store;
use crate::suppress::AlertSuppressor;
use crate::workflow::WorkflowClient;
use notify::{Notifier, NotifyEvent};

/// Shared application state.
pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub queue: Arc<AlertQueue>,
    pub pipeline: Arc<Pipeline>,
    pub learning: Arc<LearningEngine>,
    pub preservation: Arc<PreservationManager>,
    pub runbooks: Arc<std::sync::RwLock<RunbookManager>>,
    pub host_monitor: Arc<HostMonitor>,
    pub suppressor: Arc<AlertSuppressor>,
    pub prometheus: PrometheusClient,
    pub loki: LokiClient,
    pub orchestrator: Option<Arc<WorkflowClient>>,
    pub notifier: Arc<Notifier>,
}

/// Build the router.
pub fn build_router(app: Arc<App>) -> Router {
    let authed = Router::new()
        .route("/webhook/alertmanager", post(alertmanager_webhook))
        .route("/maintenance/start", post(maintenance_start))
        .route("/maintenance/end", post(maintenance_end))
        .route("/runbooks/reload", post(runbooks_reload))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&app), basic_auth));

    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(metrics_endpoint))
        .route("/resume", post(resume))
        .route("/maintenance/status", get(maintenance_status))
        .route("/patterns", get(patterns))
        .route("/patterns/{id}", get(pattern_by_id))
        .route("/analytics", get(analytics))
        .route("/runbooks", get(runbooks_list))
        .route("/runbooks/{alert}", get(runbook_by_alert))
        .route("/external-services", get(external_services))
        .route("/statistics", get(statistics))
        .merge(authed)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

/// Reject requests without valid Basic credentials.
async fn basic_auth(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .is_some_and(|credentials| {
            credentials.split_once(':').is_some_and(|(user, password)| {
                constant_time_eq(user.as_bytes(), app.config.webhook_auth_username.as_bytes())
                    && constant_time_eq(
                        password.as_bytes(),
                        app.config.webhook_auth_password.as_bytes(),
                    )
            })
        });

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic")],
            Json(json!({"error": "Invalid credentials"})),
        )
            .into_response()
    }
}

/// Compare secrets without early exit on the first mismatching byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// =============================================================================
// Core endpoints
// =============================================================================

async fn health(State(app): State<Arc<App>>) -> impl IntoResponse {
    let db_connected = app.store.health_check().await;
    metrics::set_database_up(db_connected);

    let degraded = app.queue.is_degraded().await;
    let status = if degraded {
        "degraded"
    } else if db_connected {
        "healthy"
    } else {
        "unhealthy"
    };

    let maintenance_mode = if db_connected {
        app.store.is_maintenance_mode().await.unwrap_or(false)
    } else {
        false
    };

    let mut body = json!({
        "status": status,
        "version": app.config.app_version,
        "timestamp": Utc::now().to_rfc3339(),
        "database_connected": db_connected,
        "maintenance_mode": maintenance_mode,
    });

    let stats = app.queue.stats().await;
    if stats.queue_depth > 0 {
        body["queue_stats"] = serde_json::to_value(&stats).unwrap_or(Value::Null);
    }

    Json(body)
}

async fn version(State(app): State<Arc<App>>) -> impl IntoResponse {
    Json(json!({
        "name": app.config.app_name,
        "version": app.config.app_version,
    }))
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

async fn alertmanager_webhook(
    State(app): State<Arc<App>>,
    Json(payload): Json<AlertmanagerPayload>,
) -> impl IntoResponse {
    info!(
        alert_count = payload.alerts.len(),
        status = %payload.status,
        receiver = %payload.receiver,
        "Webhook received"
    );

    // Resolution path: clear counters and cooldowns, no remediation.
    if payload.status == "resolved" {
        for alert in &payload.alerts {
            app.pipeline.handle_resolved(alert).await;
        }
        return Json(json!({
            "status": "resolved",
            "alerts_processed": payload.alerts.len(),
            "attempts_cleared": true,
        }));
    }

    let mut results = Vec::new();
    for alert in &payload.alerts {
        if !alert.is_firing() {
            info!(alert_name = alert.name(), status = %alert.status, "Alert not firing, skipped");
            continue;
        }

        let outcome = app.pipeline.process_alert(alert).await;
        let mut entry = serde_json::to_value(&outcome).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut entry {
            map.insert("alert".to_string(), json!(alert.name()));
        }
        results.push(entry);
    }

    Json(json!({
        "status": "processed",
        "alerts_processed": results.len(),
        "results": results,
    }))
}

#[derive(Debug, Deserialize)]
struct ResumeRequest {
    handoff_id: String,
}

async fn resume(
    State(app): State<Arc<App>>,
    Json(request): Json<ResumeRequest>,
) -> impl IntoResponse {
    match app
        .preservation
        .resume_from_handoff(&request.handoff_id)
        .await
    {
        Ok(context) => {
            metrics::record_self_restart("engine", "success");
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "handoff_id": request.handoff_id,
                    "remediation_context": context,
                })),
            )
        }
        Err(e) => {
            error!(handoff_id = %request.handoff_id, error = %e, "Resume failed");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

// =============================================================================
// Maintenance windows
// =============================================================================

#[derive(Debug, Deserialize)]
struct MaintenanceStartParams {
    host: Option<String>,
    reason: Option<String>,
    created_by: Option<String>,
}

async fn maintenance_start(
    State(app): State<Arc<App>>,
    Query(params): Query<MaintenanceStartParams>,
) -> impl IntoResponse {
    let reason = params.reason.unwrap_or_else(|| "Manual maintenance".to_string());
    let created_by = params.created_by.unwrap_or_else(|| "manual".to_string());

    match app
        .store
        .start_maintenance_window(params.host.as_deref(), &reason, &created_by)
        .await
    {
        Ok((window, created)) => {
            if created {
                let scope = window
                    .host
                    .clone()
                    .unwrap_or_else(|| "all hosts".to_string());
                app.notifier.notify(NotifyEvent::MaintenanceStarted {
                    scope,
                    reason: window.reason.clone(),
                    created_by: window.created_by.clone(),
                    timestamp: Utc::now(),
                });
                (
                    StatusCode::OK,
                    Json(json!({"status": "started", "maintenance_window": window})),
                )
            } else {
                (
                    StatusCode::OK,
                    Json(json!({
                        "status": "already_active",
                        "message": format!(
                            "Maintenance window already active for {}",
                            window.host.as_deref().unwrap_or("all hosts")
                        ),
                        "maintenance_window": window,
                    })),
                )
            }
        }
        Err(e) => store_error("maintenance start failed", &e),
    }
}

#[derive(Debug, Deserialize)]
struct MaintenanceEndParams {
    window_id: Option<i64>,
    host: Option<String>,
}

async fn maintenance_end(
    State(app): State<Arc<App>>,
    Query(params): Query<MaintenanceEndParams>,
) -> impl IntoResponse {
    match app
        .store
        .end_maintenance_windows(params.window_id, params.host.as_deref())
        .await
    {
        Ok(windows) if windows.is_empty() => (
            StatusCode::OK,
            Json(json!({
                "status": "not_found",
                "message": "No active maintenance window found",
            })),
        ),
        Ok(windows) => {
            for window in &windows {
                let duration_mins = window
                    .ended_at
                    .map_or(0, |end| (end - window.started_at).num_minutes());
                app.notifier.notify(NotifyEvent::MaintenanceEnded {
                    scope: window
                        .host
                        .clone()
                        .unwrap_or_else(|| "all hosts".to_string()),
                    duration_mins,
                    suppressed_alerts: window.suppressed_alert_count,
                    timestamp: Utc::now(),
                });
            }
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ended",
                    "windows_ended": windows.len(),
                    "maintenance_windows": windows,
                })),
            )
        }
        Err(e) => store_error("maintenance end failed", &e),
    }
}

async fn maintenance_status(State(app): State<Arc<App>>) -> impl IntoResponse {
    match app.store.maintenance_status().await {
        Ok((active, recent)) => (
            StatusCode::OK,
            Json(json!({
                "in_maintenance": !active.is_empty(),
                "active_windows": active,
                "recent_windows": recent,
            })),
        ),
        Err(e) => store_error("maintenance status failed", &e),
    }
}

// =============================================================================
// Patterns and analytics
// =============================================================================

#[derive(Debug, Deserialize)]
struct PatternsParams {
    #[serde(default)]
    min_confidence: f64,
    limit: Option<usize>,
}

async fn patterns(
    State(app): State<Arc<App>>,
    Query(params): Query<PatternsParams>,
) -> impl IntoResponse {
    let all = app.learning.cached_patterns().await;
    let limit = params.limit.unwrap_or(100);

    let selected: Vec<Value> = all
        .iter()
        .filter(|p| p.confidence_score >= params.min_confidence)
        .take(limit)
        .map(|p| {
            json!({
                "id": p.id,
                "alert_name": p.alert_name,
                "category": p.alert_category,
                "confidence": (p.confidence_score * 1000.0).round() / 1000.0,
                "success_count": p.success_count,
                "failure_count": p.failure_count,
                "usage_count": p.usage_count,
                "risk_level": p.risk_level,
                "target_host": p.target_host,
                "solution": p.solution_commands,
                "root_cause": p.root_cause,
                "last_used": p.last_used_at.map(|t| t.to_rfc3339()),
                "avg_execution_time": p.avg_execution_time,
            })
        })
        .collect();

    Json(json!({"count": selected.len(), "patterns": selected}))
}

async fn pattern_by_id(
    State(app): State<Arc<App>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match app.store.get_pattern(id).await {
        Ok(Some(pattern)) => (
            StatusCode::OK,
            Json(json!({
                "id": pattern.id,
                "alert_name": pattern.alert_name,
                "category": pattern.alert_category,
                "symptom_fingerprint": pattern.symptom_fingerprint,
                "root_cause": pattern.root_cause,
                "solution": pattern.solution_commands,
                "statistics": {
                    "confidence": (pattern.confidence_score * 1000.0).round() / 1000.0,
                    "success_count": pattern.success_count,
                    "failure_count": pattern.failure_count,
                    "usage_count": pattern.usage_count,
                    "avg_execution_time": pattern.avg_execution_time,
                },
                "risk_level": pattern.risk_level,
                "enabled": pattern.enabled,
                "timestamps": {
                    "created": pattern.created_at.to_rfc3339(),
                    "updated": pattern.updated_at.map(|t| t.to_rfc3339()),
                    "last_used": pattern.last_used_at.map(|t| t.to_rfc3339()),
                },
            })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Pattern {id} not found")})),
        ),
        Err(e) => store_error("pattern lookup failed", &e),
    }
}

async fn analytics(State(app): State<Arc<App>>) -> impl IntoResponse {
    let pattern_stats = match app.store.pattern_stats().await {
        Ok(stats) => stats,
        Err(e) => return store_error("analytics failed", &e),
    };
    let remediation_stats = match app.store.get_statistics(30).await {
        Ok(stats) => stats,
        Err(e) => return store_error("analytics failed", &e),
    };

    #[allow(clippy::cast_precision_loss)]
    let api_calls_saved = if pattern_stats.total_patterns > 0 {
        pattern_stats.high_confidence as f64 * pattern_stats.total_usage as f64
            / pattern_stats.total_patterns as f64
    } else {
        0.0
    };

    (
        StatusCode::OK,
        Json(json!({
            "learning_engine": {
                "total_patterns": pattern_stats.total_patterns,
                "high_confidence_patterns": pattern_stats.high_confidence,
                "medium_confidence_patterns": pattern_stats.medium_confidence,
                "average_confidence": pattern_stats.avg_confidence,
                "total_pattern_usage": pattern_stats.total_usage,
                "estimated_api_calls_saved": api_calls_saved as i64,
            },
            "remediation_performance": {
                "total_attempts_30d": remediation_stats.total_attempts,
                "successful": remediation_stats.successful,
                "escalated": remediation_stats.escalated,
                "success_rate": (remediation_stats.success_rate * 10.0).round() / 10.0,
                "avg_duration_seconds": remediation_stats.avg_duration,
                "unique_alerts": remediation_stats.unique_alerts,
            },
        })),
    )
}

#[derive(Debug, Deserialize)]
struct StatisticsParams {
    days: Option<i64>,
}

async fn statistics(
    State(app): State<Arc<App>>,
    Query(params): Query<StatisticsParams>,
) -> impl IntoResponse {
    let days = params.days.unwrap_or(7).clamp(1, 365);
    match app.store.get_statistics(days).await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({"period_days": days, "statistics": stats})),
        ),
        Err(e) => store_error("statistics failed", &e),
    }
}

// =============================================================================
// Runbooks
// =============================================================================

async fn runbooks_list(State(app): State<Arc<App>>) -> impl IntoResponse {
    let runbooks = app.runbooks.read().expect("runbook lock");
    let list: Vec<Value> = runbooks
        .list()
        .iter()
        .map(|r| {
            json!({
                "alert_name": r.alert_name,
                "title": r.title,
                "risk_level": r.risk_level,
                "estimated_duration": r.estimated_duration,
            })
        })
        .collect();

    Json(json!({"status": "ok", "count": list.len(), "runbooks": list}))
}

async fn runbook_by_alert(
    State(app): State<Arc<App>>,
    Path(alert): Path<String>,
) -> impl IntoResponse {
    let runbooks = app.runbooks.read().expect("runbook lock");
    match runbooks.get(&alert) {
        Some(runbook) => (StatusCode::OK, Json(serde_json::to_value(runbook).unwrap_or(Value::Null))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No runbook found for alert: {alert}")})),
        ),
    }
}

async fn runbooks_reload(State(app): State<Arc<App>>) -> impl IntoResponse {
    let count = {
        let mut runbooks = app.runbooks.write().expect("runbook lock");
        runbooks.load()
    };
    Json(json!({"status": "reloaded", "count": count}))
}

// =============================================================================
// External dependencies
// =============================================================================

async fn external_services(State(app): State<Arc<App>>) -> impl IntoResponse {
    let prometheus_healthy = app.prometheus.health_check().await;
    let loki_healthy = app.loki.health_check().await;
    let orchestrator_healthy = match &app.orchestrator {
        Some(orchestrator) => Some(orchestrator.health_check().await),
        None => None,
    };

    let hosts: Vec<Value> = app
        .host_monitor
        .all_statuses()
        .await
        .into_iter()
        .map(|state| {
            json!({
                "host": state.host.as_str(),
                "status": state.status.as_str(),
                "failure_count": state.failure_count,
                "last_success_at": state.last_success_at.map(|t| t.to_rfc3339()),
            })
        })
        .collect();

    let suppression = app.suppressor.stats().await;

    Json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "services": {
            "prometheus": {"healthy": prometheus_healthy},
            "loki": {"healthy": loki_healthy},
            "orchestrator": orchestrator_healthy
                .map_or(json!({"configured": false}), |h| json!({"healthy": h})),
        },
        "hosts": hosts,
        "suppression": suppression,
    }))
}

fn store_error(context: &str, e: &crate::error::EngineError) -> (StatusCode, Json<Value>) {
    warn!(error = %e, context, "Store-backed endpoint failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": format!("{context}: {e}")})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(constant_time_eq(b"", b""));
    }
}
