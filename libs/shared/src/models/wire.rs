//! Wire protocol shared by the WebSocket endpoint, the broadcaster, and the
//! channel supervisor.
//!
//! Journaled agent events travel as [`EventEnvelope`] (`{seq, type,
//! payload}`). Everything else on the socket is a meta frame and is never
//! journaled.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sandbox::SandboxStatus;

/// Event types the relay itself must recognize. All other event types pass
/// through the journal opaquely.
pub mod event_kind {
    /// RPC reply from the agent; resolved against a pending call, never
    /// journaled.
    pub const RESPONSE: &str = "response";
    /// Host-capability request from the agent; forwarded to subscribers.
    pub const NATIVE_TOOL_REQUEST: &str = "native_tool_request";
    /// Cancels an in-flight native tool request.
    pub const NATIVE_TOOL_CANCEL: &str = "native_tool_cancel";
    /// Terminal event of an agent turn; also synthesized by the relay when
    /// the transport dies.
    pub const AGENT_END: &str = "agent_end";
}

/// A journaled agent event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

/// Server-initiated frames that are never journaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MetaFrame {
    Connected { session_id: String, last_seq: i64 },
    ReplayStart { from: i64, to: i64 },
    ReplayEnd,
    SandboxStatus { status: SandboxStatus },
    Error { code: String, message: String },
}

impl MetaFrame {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        MetaFrame::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Client-initiated frames: the agent command vocabulary plus the native
/// tool response leg. Unknown types fail deserialization and are rejected
/// with an error frame, leaving the socket open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    Prompt {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    GetState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    SetModel {
        provider: String,
        model_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    GetMessages {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    GetAvailableModels {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    NativeToolResponse {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl ClientCommand {
    /// The `command` name the agent echoes back in its `response` frame.
    pub fn command_name(&self) -> &'static str {
        match self {
            ClientCommand::Prompt { .. } => "prompt",
            ClientCommand::Abort { .. } => "abort",
            ClientCommand::GetState { .. } => "get_state",
            ClientCommand::SetModel { .. } => "set_model",
            ClientCommand::GetMessages { .. } => "get_messages",
            ClientCommand::GetAvailableModels { .. } => "get_available_models",
            ClientCommand::NativeToolResponse { .. } => "native_tool_response",
        }
    }

    /// Commands the agent answers with a correlated `response` frame.
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            ClientCommand::GetState { .. }
                | ClientCommand::SetModel { .. }
                | ClientCommand::GetMessages { .. }
                | ClientCommand::GetAvailableModels { .. }
        )
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            ClientCommand::Prompt { id, .. }
            | ClientCommand::Abort { id }
            | ClientCommand::GetState { id }
            | ClientCommand::SetModel { id, .. }
            | ClientCommand::GetMessages { id }
            | ClientCommand::GetAvailableModels { id } => id.as_deref(),
            ClientCommand::NativeToolResponse { .. } => None,
        }
    }
}

/// Build an agent `response` frame. Used by the relay to synthesize RPC
/// failures (timeout, cancel, transport loss) in the same shape the agent
/// produces.
pub fn synthetic_response(command: &str, id: Option<&str>, error: &str) -> Value {
    let mut frame = serde_json::json!({
        "type": event_kind::RESPONSE,
        "command": command,
        "success": false,
        "error": error,
    });
    if let (Some(obj), Some(id)) = (frame.as_object_mut(), id) {
        obj.insert("id".to_string(), Value::String(id.to_string()));
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_frames_use_camel_case_fields() {
        let frame = MetaFrame::Connected {
            session_id: "s-1".into(),
            last_seq: 7,
        };
        let json = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(json["type"], "connected");
        assert_eq!(json["sessionId"], "s-1");
        assert_eq!(json["lastSeq"], 7);
    }

    #[test]
    fn event_envelope_uses_type_key() {
        let envelope = EventEnvelope {
            seq: 3,
            kind: "message_update".into(),
            payload: serde_json::json!({"delta": "hi"}),
        };
        let json = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["type"], "message_update");
        assert_eq!(json["payload"]["delta"], "hi");
    }

    #[test]
    fn client_commands_parse_from_wire_json() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"prompt","message":"hello"}"#).expect("parse");
        assert_eq!(cmd.command_name(), "prompt");
        assert!(!cmd.expects_response());

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"set_model","provider":"anthropic","modelId":"claude"}"#)
                .expect("parse");
        assert!(cmd.expects_response());

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"native_tool_response","callId":"c1","result":{}}"#)
                .expect("parse");
        assert_eq!(cmd.command_name(), "native_tool_response");
    }

    #[test]
    fn unknown_command_type_fails_to_parse() {
        let parsed = serde_json::from_str::<ClientCommand>(r#"{"type":"reboot_host"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn synthetic_response_carries_correlation() {
        let frame = synthetic_response("get_state", Some("req-9"), "REQUEST_TIMEOUT");
        assert_eq!(frame["type"], "response");
        assert_eq!(frame["command"], "get_state");
        assert_eq!(frame["id"], "req-9");
        assert_eq!(frame["success"], false);
        assert_eq!(frame["error"], "REQUEST_TIMEOUT");
    }
}
