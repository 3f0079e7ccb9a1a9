//! In-memory provider with a deterministic scripted agent. Backs the test
//! suite and offline development; implements the full command surface the
//! clients exercise.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

use moor_shared::models::sandbox::{ProviderType, SandboxCapabilities, SandboxStatus};

use crate::channel::{AgentChannel, ChannelHub};
use crate::provider::{
    CleanupReport, SandboxError, SandboxHandle, SandboxInfo, SandboxProvider, SandboxSpec,
    StatusCell,
};

const CAPABILITIES: SandboxCapabilities = SandboxCapabilities {
    lossless_pause: true,
    persistent_disk: false,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct MockOptions {
    /// When set, the scripted agent never answers RPC commands. Used to
    /// exercise request timeouts.
    pub silent_rpc: bool,
}

pub struct MockProvider {
    options: MockOptions,
    sandboxes: Mutex<HashMap<String, Arc<MockSandbox>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_options(MockOptions::default())
    }

    pub fn with_options(options: MockOptions) -> Self {
        Self {
            options,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Mock
    }

    fn capabilities(&self) -> SandboxCapabilities {
        CAPABILITIES
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn create_sandbox(
        &self,
        spec: SandboxSpec,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let provider_id = format!("mock-{}", spec.session_id);
        let sandbox = Arc::new(
            MockSandbox::start(provider_id.clone(), spec.session_id.clone(), self.options).await,
        );

        let mut sandboxes = self.sandboxes.lock().await;
        sandboxes.insert(provider_id, sandbox.clone());
        Ok(sandbox)
    }

    async fn get_sandbox(
        &self,
        provider_id: &str,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let sandboxes = self.sandboxes.lock().await;
        match sandboxes.get(provider_id) {
            Some(sandbox) if sandbox.status.get() != SandboxStatus::Stopped => {
                Ok(sandbox.clone())
            }
            _ => Err(SandboxError::NotFound(provider_id.to_string())),
        }
    }

    async fn list_sandboxes(&self) -> Result<Vec<SandboxInfo>, SandboxError> {
        let sandboxes = self.sandboxes.lock().await;
        Ok(sandboxes
            .values()
            .filter(|sandbox| sandbox.status.get() != SandboxStatus::Stopped)
            .map(|sandbox| SandboxInfo {
                provider_id: sandbox.provider_id.clone(),
                provider_type: ProviderType::Mock,
                status: sandbox.status.get(),
                session_id: Some(sandbox.session_id.clone()),
            })
            .collect())
    }

    async fn cleanup(&self) -> Result<CleanupReport, SandboxError> {
        let mut sandboxes = self.sandboxes.lock().await;
        let stopped: Vec<String> = sandboxes
            .iter()
            .filter(|(_, sandbox)| sandbox.status.get() == SandboxStatus::Stopped)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stopped {
            sandboxes.remove(id);
        }
        Ok(CleanupReport {
            removed: stopped.len(),
            artifacts: stopped,
        })
    }
}

struct MockSandbox {
    provider_id: String,
    session_id: String,
    hub: Arc<ChannelHub>,
    status: StatusCell,
    cancel: CancellationToken,
}

impl MockSandbox {
    async fn start(provider_id: String, session_id: String, options: MockOptions) -> Self {
        let hub = ChannelHub::new();
        let status = StatusCell::new(SandboxStatus::Creating);
        let cancel = CancellationToken::new();

        let (stdin_tx, stdin_rx) = mpsc::channel(256);
        hub.wire_stdin(stdin_tx).await;

        let agent_hub = hub.clone();
        let agent_cancel = cancel.clone();
        tokio::spawn(async move {
            run_scripted_agent(agent_hub, stdin_rx, agent_cancel, options).await;
        });

        status.set(SandboxStatus::Running);
        Self {
            provider_id,
            session_id,
            hub,
            status,
            cancel,
        }
    }
}

#[async_trait]
impl SandboxHandle for MockSandbox {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn capabilities(&self) -> SandboxCapabilities {
        CAPABILITIES
    }

    fn status(&self) -> SandboxStatus {
        self.status.get()
    }

    fn watch_status(&self) -> watch::Receiver<SandboxStatus> {
        self.status.subscribe()
    }

    async fn resume(
        &self,
        _secrets: Option<HashMap<String, String>>,
        _repo_auth_token: Option<String>,
    ) -> Result<(), SandboxError> {
        match self.status.get() {
            SandboxStatus::Paused | SandboxStatus::Creating => {
                self.status.set(SandboxStatus::Running);
                Ok(())
            }
            SandboxStatus::Running => Ok(()),
            other => Err(SandboxError::Operation(format!(
                "cannot resume sandbox in state {other}"
            ))),
        }
    }

    async fn pause(&self) -> Result<(), SandboxError> {
        match self.status.get() {
            SandboxStatus::Running => {
                self.status.set(SandboxStatus::Paused);
                Ok(())
            }
            SandboxStatus::Paused => Ok(()),
            other => Err(SandboxError::Operation(format!(
                "cannot pause sandbox in state {other}"
            ))),
        }
    }

    async fn attach(&self) -> Result<AgentChannel, SandboxError> {
        if self.status.get() == SandboxStatus::Stopped {
            return Err(SandboxError::NotFound(self.provider_id.clone()));
        }
        Ok(self.hub.attach().await)
    }

    async fn terminate(&self) -> Result<(), SandboxError> {
        self.status.set(SandboxStatus::Stopping);
        self.cancel.cancel();
        self.hub.notify_peer_exit().await;
        self.status.set(SandboxStatus::Stopped);
        Ok(())
    }
}

// ── Scripted agent ─────────────────────────────────────────────────────────

struct AgentState {
    options: MockOptions,
    model_provider: String,
    model_id: String,
    messages: Vec<Value>,
    message_counter: u64,
    call_counter: u64,
    native_results: Vec<Value>,
}

async fn run_scripted_agent(
    hub: Arc<ChannelHub>,
    mut stdin: mpsc::Receiver<String>,
    cancel: CancellationToken,
    options: MockOptions,
) {
    let mut state = AgentState {
        options,
        model_provider: "anthropic".to_string(),
        model_id: "claude-sonnet-4-5".to_string(),
        messages: Vec::new(),
        message_counter: 0,
        call_counter: 0,
        native_results: Vec::new(),
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = stdin.recv() => match line {
                Some(line) => handle_command(&hub, &mut state, &line).await,
                None => break,
            }
        }
    }
}

async fn emit(hub: &ChannelHub, frame: Value) {
    hub.dispatch_line(frame.to_string()).await;
}

async fn respond(hub: &ChannelHub, state: &AgentState, command: &str, id: Option<&Value>, data: Value) {
    if state.options.silent_rpc {
        return;
    }
    let mut frame = json!({
        "type": "response",
        "command": command,
        "success": true,
        "data": data,
    });
    if let (Some(obj), Some(id)) = (frame.as_object_mut(), id) {
        obj.insert("id".to_string(), id.clone());
    }
    emit(hub, frame).await;
}

async fn handle_command(hub: &ChannelHub, state: &mut AgentState, line: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(line) else {
        emit(
            hub,
            json!({"type": "response", "success": false, "error": "invalid_json"}),
        )
        .await;
        return;
    };

    let id = frame.get("id").cloned();
    let command = frame
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match command.as_str() {
        "prompt" => {
            let message = frame
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            run_prompt(hub, state, &message).await;
        }
        "abort" => {
            emit(hub, json!({"type": "agent_end", "success": false, "error": "aborted"})).await;
        }
        "get_state" => {
            let data = json!({
                "status": "idle",
                "model": {"provider": state.model_provider, "modelId": state.model_id},
                "nativeToolResults": state.native_results.len(),
            });
            respond(hub, state, "get_state", id.as_ref(), data).await;
        }
        "set_model" => {
            if let Some(provider) = frame.get("provider").and_then(Value::as_str) {
                state.model_provider = provider.to_string();
            }
            if let Some(model_id) = frame.get("modelId").and_then(Value::as_str) {
                state.model_id = model_id.to_string();
            }
            let data = json!({"provider": state.model_provider, "modelId": state.model_id});
            respond(hub, state, "set_model", id.as_ref(), data).await;
        }
        "get_messages" => {
            let data = json!({"messages": state.messages});
            respond(hub, state, "get_messages", id.as_ref(), data).await;
        }
        "get_available_models" => {
            let data = json!({"models": [
                {"provider": "anthropic", "modelId": "claude-sonnet-4-5"},
                {"provider": "anthropic", "modelId": "claude-opus-4-1"},
                {"provider": "openai", "modelId": "gpt-5"},
            ]});
            respond(hub, state, "get_available_models", id.as_ref(), data).await;
        }
        "native_tool_response" => {
            state.native_results.push(frame);
        }
        other => {
            if !state.options.silent_rpc {
                let mut reply = json!({
                    "type": "response",
                    "command": other,
                    "success": false,
                    "error": "unknown_command",
                });
                if let (Some(obj), Some(id)) = (reply.as_object_mut(), id.as_ref()) {
                    obj.insert("id".to_string(), id.clone());
                }
                emit(hub, reply).await;
            }
        }
    }
}

async fn run_prompt(hub: &ChannelHub, state: &mut AgentState, message: &str) {
    emit(hub, json!({"type": "agent_start"})).await;

    if let Some(tool_input) = message.strip_prefix("!tool ") {
        state.call_counter += 1;
        let tool_id = format!("tool-{}", state.call_counter);
        emit(
            hub,
            json!({
                "type": "tool_execution_start",
                "toolId": tool_id,
                "toolName": "echo",
                "args": {"input": tool_input},
            }),
        )
        .await;
        emit(
            hub,
            json!({
                "type": "tool_execution_end",
                "toolId": tool_id,
                "result": tool_input,
                "isError": false,
            }),
        )
        .await;
    }

    if let Some(tool_name) = message.strip_prefix("!native ") {
        state.call_counter += 1;
        let call_id = format!("call-{}", state.call_counter);
        emit(
            hub,
            json!({
                "type": "native_tool_request",
                "callId": call_id,
                "toolName": tool_name,
                "args": {},
            }),
        )
        .await;
    }

    state.message_counter += 1;
    let message_id = format!("msg-{}", state.message_counter);
    let reply = format!("You said: {message}");

    emit(
        hub,
        json!({"type": "message_start", "messageId": message_id, "role": "assistant"}),
    )
    .await;
    for word in reply.split_whitespace() {
        emit(
            hub,
            json!({"type": "message_update", "messageId": message_id, "delta": format!("{word} ")}),
        )
        .await;
    }
    emit(
        hub,
        json!({"type": "message_end", "messageId": message_id, "content": reply}),
    )
    .await;

    state.messages.push(json!({"role": "user", "content": message}));
    state.messages.push(json!({"role": "assistant", "content": reply}));

    emit(hub, json!({"type": "agent_end", "success": true})).await;
}
