//! Surface router: normalizes surface-specific payloads into a uniform
//! workflow-creation request plus a surface context, and verifies webhook
//! signatures. Binding enforcement itself happens in the service, before
//! any row is written.

use crate::service::{CreateWorkflowRequest, ServiceError, SurfaceContext};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;
use workflow_engine::{Priority, SurfaceType, WorkflowType};

type HmacSha256 = Hmac<Sha256>;

pub struct SurfaceRouter {
    webhook_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub request: CreateWorkflowRequest,
    pub surface: Option<SurfaceContext>,
}

impl SurfaceRouter {
    pub fn new(webhook_secret: Option<String>) -> Self {
        Self { webhook_secret }
    }

    /// REST body → creation request. The surface context is attached only
    /// when the request targets a platform.
    pub fn normalize_rest(
        &self,
        request: CreateWorkflowRequest,
        surface_id: Option<Uuid>,
    ) -> NormalizedRequest {
        let surface = request.platform_id.map(|_| SurfaceContext {
            surface_id: surface_id.unwrap_or_else(Uuid::new_v4),
            surface_type: SurfaceType::Rest,
            metadata: Value::Null,
        });
        NormalizedRequest { request, surface }
    }

    /// GitHub-style webhook payload → creation request. The caller has
    /// already verified the signature.
    pub fn normalize_webhook(&self, payload: &Value) -> Result<NormalizedRequest, ServiceError> {
        let repository = payload
            .get("repository")
            .and_then(|r| r.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("webhook");
        let action = payload.get("action").and_then(|a| a.as_str()).unwrap_or("push");
        let platform_id = payload
            .get("platform_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());

        let request = CreateWorkflowRequest {
            name: format!("{repository}-{action}"),
            workflow_type: Some(WorkflowType::Bugfix),
            platform_id,
            definition_id: None,
            definition_name: payload
                .get("definition_name")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            priority: Some(Priority::High),
            input_data: payload.clone(),
        };

        let surface = platform_id.map(|_| SurfaceContext {
            surface_id: Uuid::new_v4(),
            surface_type: SurfaceType::Webhook,
            metadata: serde_json::json!({ "repository": repository, "action": action }),
        });

        Ok(NormalizedRequest { request, surface })
    }

    /// CLI, dashboard and mobile payloads share one JSON shape: the
    /// creation request itself plus an optional surface block. Each kind
    /// differs only in the surface type stamped on the context.
    pub fn normalize_submission(
        &self,
        surface_type: SurfaceType,
        payload: &Value,
    ) -> Result<NormalizedRequest, ServiceError> {
        let request: CreateWorkflowRequest = serde_json::from_value(payload.clone())
            .map_err(|e| ServiceError::Validation { message: format!("invalid payload: {e}") })?;

        let surface = request.platform_id.map(|_| SurfaceContext {
            surface_id: Uuid::new_v4(),
            surface_type,
            metadata: payload.get("surface_metadata").cloned().unwrap_or(Value::Null),
        });

        Ok(NormalizedRequest { request, surface })
    }

    /// Verify an `X-Hub-Signature-256`-style header (`sha256=<hex>`)
    /// against the raw body.
    pub fn verify_webhook_signature(&self, body: &[u8], signature_header: &str) -> bool {
        let Some(secret) = &self.webhook_secret else {
            // No secret configured: webhooks are refused outright rather
            // than accepted unsigned.
            return false;
        };

        let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
            return false;
        };
        let Some(expected) = decode_hex(hex_digest) else {
            return false;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("sha256={hex}")
    }

    #[test]
    fn webhook_signature_round_trip() {
        let router = SurfaceRouter::new(Some("topsecret".to_string()));
        let body = br#"{"action":"push"}"#;

        let header = signed("topsecret", body);
        assert!(router.verify_webhook_signature(body, &header));
        assert!(!router.verify_webhook_signature(b"tampered", &header));
        assert!(!router.verify_webhook_signature(body, "sha256=deadbeef"));
        assert!(!router.verify_webhook_signature(body, "not-a-signature"));
    }

    #[test]
    fn unsigned_webhooks_are_refused_without_a_secret() {
        let router = SurfaceRouter::new(None);
        let body = b"{}";
        assert!(!router.verify_webhook_signature(body, &signed("anything", body)));
    }

    #[test]
    fn webhook_payload_normalizes_to_a_request() {
        let router = SurfaceRouter::new(Some("s".to_string()));
        let payload = serde_json::json!({
            "repository": { "name": "billing-api" },
            "action": "opened",
        });

        let normalized = router.normalize_webhook(&payload).unwrap();
        assert_eq!(normalized.request.name, "billing-api-opened");
        assert_eq!(normalized.request.workflow_type, Some(WorkflowType::Bugfix));
        assert!(normalized.surface.is_none());
    }

    #[test]
    fn cli_submissions_carry_the_cli_surface_type() {
        let router = SurfaceRouter::new(None);
        let payload = serde_json::json!({
            "name": "fix-login",
            "type": "bugfix",
            "platform_id": Uuid::new_v4(),
            "surface_metadata": { "argv": ["orchestrate", "create"] },
        });

        let normalized = router.normalize_submission(SurfaceType::Cli, &payload).unwrap();
        let surface = normalized.surface.unwrap();
        assert_eq!(surface.surface_type, SurfaceType::Cli);
        assert_eq!(surface.metadata["argv"][0], "orchestrate");
    }

    #[test]
    fn rest_requests_only_get_a_surface_with_a_platform() {
        let router = SurfaceRouter::new(None);
        let request = CreateWorkflowRequest {
            name: "fix-login".to_string(),
            workflow_type: Some(WorkflowType::Bugfix),
            platform_id: None,
            definition_id: None,
            definition_name: None,
            priority: None,
            input_data: Value::Null,
        };
        assert!(router.normalize_rest(request.clone(), None).surface.is_none());

        let mut platform_request = request;
        platform_request.platform_id = Some(Uuid::new_v4());
        let normalized = router.normalize_rest(platform_request, None);
        assert_eq!(normalized.surface.unwrap().surface_type, SurfaceType::Rest);
    }
}
