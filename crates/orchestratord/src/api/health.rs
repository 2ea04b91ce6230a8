use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::instrument;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

#[instrument(skip(state))]
pub async fn liveness(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
    })
}

#[instrument(skip(state))]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_ready() && state.is_accepting() {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "ready": false })))
    }
}

#[instrument(skip(state))]
pub async fn detailed(State(state): State<AppState>) -> impl IntoResponse {
    let bus = match state.bus.health().await {
        Ok(latency) => serde_json::json!({ "ok": true, "latency_ms": latency.as_millis() }),
        Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
    };
    let kv = match state.kv.health().await {
        Ok(latency) => serde_json::json!({ "ok": true, "latency_ms": latency.as_millis() }),
        Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
    };
    let store = match state.stats.overview().await {
        Ok(overview) => serde_json::json!({
            "ok": true,
            "total_workflows": overview.total_workflows,
        }),
        Err(e) => serde_json::json!({ "ok": false, "error": e.to_string() }),
    };

    let healthy = bus["ok"].as_bool().unwrap_or(false)
        && kv["ok"].as_bool().unwrap_or(false)
        && store["ok"].as_bool().unwrap_or(false);

    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_seconds(),
        "instance": state.service.instance_id(),
        "dependencies": { "bus": bus, "kv": kv, "store": store },
        "agents": state.service.registry().known_types(),
    });

    let code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body))
}
