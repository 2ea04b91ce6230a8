//! WebSocket fan-out of the workflow lifecycle stream. Observers may filter
//! by trace or platform; messages are JSON lifecycle events typed by
//! `event_type`.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use serde::Deserialize;
use tracing::{debug, instrument};
use uuid::Uuid;
use workflow_engine::LifecycleEvent;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WsFilter {
    pub trace_id: Option<Uuid>,
    pub platform_id: Option<Uuid>,
}

#[instrument(skip(state, upgrade))]
pub async fn upgrade(
    State(state): State<AppState>,
    Query(filter): Query<WsFilter>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| session(socket, state, filter))
}

fn matches(event: &LifecycleEvent, filter: &WsFilter) -> bool {
    if let Some(trace_id) = filter.trace_id {
        if event.trace_id != trace_id {
            return false;
        }
    }
    if let Some(platform_id) = filter.platform_id {
        let event_platform = event
            .payload
            .get("platform_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok());
        if event_platform != Some(platform_id) {
            return false;
        }
    }
    true
}

async fn session(mut socket: WebSocket, state: AppState, filter: WsFilter) {
    let mut events = state.events.subscribe();
    debug!(?filter, "websocket observer connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !matches(&event, &filter) {
                            continue;
                        }
                        let Ok(text) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Lagged observers skip ahead; the stream is advisory.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "websocket observer lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    debug!("websocket observer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_engine::EventType;

    #[test]
    fn filters_apply_to_trace_and_platform() {
        let trace_id = Uuid::new_v4();
        let platform_id = Uuid::new_v4();
        let event = LifecycleEvent::new(
            EventType::WorkflowStarted,
            Some(Uuid::new_v4()),
            trace_id,
            serde_json::json!({ "platform_id": platform_id }),
        );

        assert!(matches(&event, &WsFilter { trace_id: None, platform_id: None }));
        assert!(matches(&event, &WsFilter { trace_id: Some(trace_id), platform_id: None }));
        assert!(!matches(&event, &WsFilter { trace_id: Some(Uuid::new_v4()), platform_id: None }));
        assert!(matches(&event, &WsFilter { trace_id: None, platform_id: Some(platform_id) }));
        assert!(!matches(&event, &WsFilter { trace_id: None, platform_id: Some(Uuid::new_v4()) }));
    }
}
