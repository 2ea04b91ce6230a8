use super::ApiError;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use tracing::instrument;

/// GitHub webhook surface. The HMAC signature is checked against the raw
/// body before any parsing; workflow creation then runs asynchronously so
/// the webhook can be answered with 202 immediately.
#[instrument(skip(state, headers, body))]
pub async fn github(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if !state.is_accepting() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            "service is shutting down",
        ));
    }

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !state.surface_router.verify_webhook_signature(&body, signature) {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "INVALID_SIGNATURE",
            "webhook signature verification failed",
        ));
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid webhook payload: {e}")))?;

    let normalized = state.surface_router.normalize_webhook(&payload)?;
    let service = state.service.clone();
    let accepted_name = normalized.request.name.clone();

    tokio::spawn(async move {
        if let Err(e) = service
            .create_workflow(normalized.request, "github-webhook", normalized.surface, None)
            .await
        {
            tracing::warn!(error = %e, "webhook-triggered workflow creation failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": true, "workflow_name": accepted_name })),
    ))
}
