//! Native tool bridge: the agent asks for capabilities only the client host
//! can provide, correlated by `callId`. The relay routes without
//! validating; timeouts and retries belong to the agent.

use serde_json::Value;

use moor_shared::models::wire::event_kind;

use crate::broadcast::SessionBroadcaster;
use crate::store::Store;

pub fn is_native_tool_frame(kind: &str) -> bool {
    kind == event_kind::NATIVE_TOOL_REQUEST || kind == event_kind::NATIVE_TOOL_CANCEL
}

/// Route a `native_tool_request` / `native_tool_cancel` frame from the
/// agent. With a client attached the frame is forwarded live and never
/// journaled; with nobody attached it is journaled so the next attach
/// replays it — the agent just perceives a slow responder.
pub async fn forward_tool_frame(
    store: &Store,
    broadcaster: &SessionBroadcaster,
    session_id: &str,
    frame: Value,
) {
    if broadcaster.subscriber_count().await > 0 {
        broadcaster.publish_passthrough(frame).await;
        return;
    }

    let kind = frame
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(event_kind::NATIVE_TOOL_REQUEST)
        .to_string();
    let payload = strip_type(frame);
    match store.append_event(session_id, &kind, &payload) {
        Ok(seq) => {
            tracing::debug!(session_id, seq, "journaled native tool frame with no subscriber");
        }
        Err(error) => {
            tracing::error!(session_id, %error, "failed to journal native tool frame");
        }
    }
}

/// Remove the `type` tag; the journal stores it in its own column.
pub fn strip_type(mut frame: Value) -> Value {
    if let Some(object) = frame.as_object_mut() {
        object.remove("type");
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{DEFAULT_SUBSCRIBER_BUFFER, OutFrame, SessionBroadcaster};
    use crate::store::test_store;
    use serde_json::json;

    #[tokio::test]
    async fn forwarded_live_when_a_subscriber_is_attached() {
        let store = test_store();
        let broadcaster =
            SessionBroadcaster::new("s-1".into(), store.clone(), DEFAULT_SUBSCRIBER_BUFFER);
        let mut stream = broadcaster.subscribe(0).await.expect("subscribe");
        let _connected = stream.next().await;

        let frame = json!({"type": "native_tool_request", "callId": "c1", "toolName": "ask_user", "args": {}});
        forward_tool_frame(&store, &broadcaster, "s-1", frame.clone()).await;

        match stream.next().await {
            Some(OutFrame::Passthrough(value)) => assert_eq!(value, frame),
            other => panic!("expected passthrough, got {other:?}"),
        }
        assert_eq!(store.last_seq("s-1").expect("last"), 0, "not journaled");
    }

    #[tokio::test]
    async fn journaled_when_nobody_is_attached() {
        let store = test_store();
        let broadcaster =
            SessionBroadcaster::new("s-1".into(), store.clone(), DEFAULT_SUBSCRIBER_BUFFER);

        let frame = json!({"type": "native_tool_request", "callId": "c1", "toolName": "ask_user", "args": {}});
        forward_tool_frame(&store, &broadcaster, "s-1", frame).await;

        let entries = store.read_events_after("s-1", 0, None).expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "native_tool_request");
        assert_eq!(entries[0].payload["callId"], "c1");
        assert!(entries[0].payload.get("type").is_none());
    }
}
