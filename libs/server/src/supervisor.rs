//! Per-session channel supervisor: the exclusive owner of the attached
//! agent channel.
//!
//! Outbound (agent -> world), every stdout line is classified: `response`
//! frames resolve a pending RPC call and are never journaled; native tool
//! frames are forwarded live-only; everything else is appended to the
//! journal (assigning `seq`) and broadcast. Appends happen on the single
//! run task in arrival order, so journal order always matches channel
//! order.
//!
//! Inbound, `call` correlates a command with the agent's `response` by
//! command name (plus the optional client-supplied id) with a bounded
//! timeout; `send` is fire-and-forget.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use moor_sandbox::{AgentChannel, ChannelEvent, CloseReason, SandboxHandle, SandboxManager};
use moor_shared::models::sandbox::{ProviderType, SandboxStatus};
use moor_shared::models::session::SessionStatus;
use moor_shared::models::wire::{EventEnvelope, MetaFrame, event_kind};

use crate::bridge;
use crate::broadcast::{BroadcasterRegistry, SessionBroadcaster};
use crate::error::ServerError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("REQUEST_TIMEOUT")]
    RequestTimeout,
    #[error("CANCELLED")]
    Cancelled,
    #[error("CONNECTION_LOST")]
    ConnectionLost,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub rpc_timeout: Duration,
    pub reattach_attempts: u32,
    pub reattach_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
            reattach_attempts: 3,
            reattach_backoff: Duration::from_millis(500),
        }
    }
}

struct PendingCall {
    token: u64,
    id: Option<String>,
    tx: oneshot::Sender<Result<Value, RpcError>>,
}

#[derive(Default)]
struct PendingRegistry {
    by_command: HashMap<String, VecDeque<PendingCall>>,
}

impl PendingRegistry {
    fn register(&mut self, command: &str, call: PendingCall) {
        self.by_command
            .entry(command.to_string())
            .or_default()
            .push_back(call);
    }

    fn resolve(&mut self, command: &str, id: Option<&str>, frame: Value) {
        let Some(queue) = self.by_command.get_mut(command) else {
            return;
        };
        // Match on id when both sides carry one; otherwise the oldest
        // id-less waiter for the command. Responses nobody is waiting for
        // (timed out, cancelled) are discarded.
        let position = match id {
            Some(id) => queue
                .iter()
                .position(|call| call.id.as_deref() == Some(id))
                .or_else(|| queue.iter().position(|call| call.id.is_none())),
            None => (!queue.is_empty()).then_some(0),
        };
        if let Some(position) = position {
            if let Some(call) = queue.remove(position) {
                let _ = call.tx.send(Ok(frame));
            }
        }
    }

    fn deregister(&mut self, command: &str, token: u64) {
        if let Some(queue) = self.by_command.get_mut(command) {
            queue.retain(|call| call.token != token);
        }
    }

    fn fail_all(&mut self, error: RpcError) {
        for (_, queue) in self.by_command.drain() {
            for call in queue {
                let _ = call.tx.send(Err(error));
            }
        }
    }
}

pub struct ChannelSupervisor {
    session_id: String,
    store: Store,
    broadcaster: Arc<SessionBroadcaster>,
    outbound: mpsc::Sender<String>,
    pending: Mutex<PendingRegistry>,
    cancel: CancellationToken,
    config: SupervisorConfig,
    next_token: AtomicU64,
}

impl ChannelSupervisor {
    /// Spawn the supervisor over an already-attached channel. The run task
    /// owns the channel; a sibling task mirrors sandbox status frames.
    pub fn spawn(
        session_id: String,
        store: Store,
        broadcaster: Arc<SessionBroadcaster>,
        manager: Arc<SandboxManager>,
        binding: (ProviderType, String),
        handle: Arc<dyn SandboxHandle>,
        channel: AgentChannel,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let supervisor = Arc::new(Self {
            session_id,
            store,
            broadcaster,
            outbound: outbound_tx,
            pending: Mutex::new(PendingRegistry::default()),
            cancel: CancellationToken::new(),
            config,
            next_token: AtomicU64::new(1),
        });

        let run = supervisor.clone();
        tokio::spawn(async move {
            run.run(channel, outbound_rx, manager, binding).await;
        });

        let mirror = supervisor.clone();
        let mut status_rx = handle.watch_status();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = mirror.cancel.cancelled() => break,
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *status_rx.borrow();
                        mirror
                            .broadcaster
                            .publish_meta(MetaFrame::SandboxStatus { status })
                            .await;
                        if status == SandboxStatus::Error {
                            mirror.fail_session("sandbox_error").await;
                            break;
                        }
                    }
                }
            }
        });

        supervisor
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fire-and-forget command to the agent.
    pub async fn send(&self, frame: Value) {
        let _ = self.outbound.send(frame.to_string()).await;
    }

    /// Raw line to the agent's stdin (native tool responses).
    pub async fn send_line(&self, line: String) {
        let _ = self.outbound.send(line).await;
    }

    /// Send a command and await the agent's correlated `response` frame.
    pub async fn call(&self, command: &str, frame: Value) -> Result<Value, RpcError> {
        let id = frame
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.register(command, PendingCall { token, id, tx });
        }

        if self.outbound.send(frame.to_string()).await.is_err() {
            self.pending.lock().await.deregister(command, token);
            return Err(RpcError::ConnectionLost);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.lock().await.deregister(command, token);
                Err(RpcError::ConnectionLost)
            }
            result = tokio::time::timeout(self.config.rpc_timeout, rx) => match result {
                Ok(Ok(resolution)) => resolution,
                Ok(Err(_)) => Err(RpcError::ConnectionLost),
                Err(_) => {
                    self.pending.lock().await.deregister(command, token);
                    Err(RpcError::RequestTimeout)
                }
            }
        }
    }

    /// Cancel every in-flight call and, best-effort, tell the agent to
    /// abort. Late responses are discarded.
    pub async fn abort(&self) {
        self.pending.lock().await.fail_all(RpcError::Cancelled);
        let _ = self
            .outbound
            .send(json!({"type": "abort"}).to_string())
            .await;
    }

    /// Tear the supervisor down, closing the channel. Does not touch the
    /// sandbox itself.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pending.lock().await.fail_all(RpcError::ConnectionLost);
    }

    async fn run(
        self: Arc<Self>,
        mut channel: AgentChannel,
        mut outbound_rx: mpsc::Receiver<String>,
        manager: Arc<SandboxManager>,
        binding: (ProviderType, String),
    ) {
        let mut sender = channel.sender();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    sender.close().await;
                    break;
                }
                line = outbound_rx.recv() => {
                    match line {
                        Some(line) => sender.send(line).await,
                        None => break,
                    }
                }
                event = channel.recv() => {
                    match event {
                        Some(ChannelEvent::Line(line)) => self.handle_line(&line).await,
                        Some(ChannelEvent::Closed(reason)) => {
                            match reason {
                                // We closed stdin ourselves, or a newer
                                // owner took the channel over.
                                CloseReason::Explicit | CloseReason::Reattached => break,
                                CloseReason::PeerExit => {
                                    match self.reattach(&manager, &binding).await {
                                        Some(fresh) => {
                                            sender = fresh.sender();
                                            channel = fresh;
                                        }
                                        None => break,
                                    }
                                }
                            }
                        }
                        None => {
                            match self.reattach(&manager, &binding).await {
                                Some(fresh) => {
                                    sender = fresh.sender();
                                    channel = fresh;
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Bounded re-attach policy: while the session is `running`, retry;
    /// while it is `paused`, wait; anything else ends the supervisor. A
    /// `running` session that cannot be re-attached is failed.
    async fn reattach(
        &self,
        manager: &SandboxManager,
        binding: &(ProviderType, String),
    ) -> Option<AgentChannel> {
        let mut attempts = 0;
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            let status = match self.store.get_session(&self.session_id) {
                Ok(session) => session.status,
                Err(_) => return None,
            };

            match status {
                SessionStatus::Running => {
                    match manager.attach_session(binding.0, &binding.1).await {
                        Ok((_, channel)) => {
                            tracing::info!(
                                session_id = %self.session_id,
                                attempts,
                                "re-attached agent channel"
                            );
                            return Some(channel);
                        }
                        Err(error) => {
                            attempts += 1;
                            if attempts >= self.config.reattach_attempts {
                                tracing::warn!(
                                    session_id = %self.session_id,
                                    %error,
                                    "giving up on re-attach"
                                );
                                self.fail_session("transport_disconnect").await;
                                return None;
                            }
                        }
                    }
                }
                SessionStatus::Paused | SessionStatus::Ready => {
                    // Suspended: hold position until resume or teardown.
                }
                _ => return None,
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reattach_backoff) => {}
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        let Ok(frame) = serde_json::from_str::<Value>(line) else {
            tracing::warn!(session_id = %self.session_id, "agent emitted a non-JSON line");
            return;
        };
        let kind = frame
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if kind == event_kind::RESPONSE {
            let command = frame
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let id = frame
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let mut pending = self.pending.lock().await;
            pending.resolve(&command, id.as_deref(), frame);
            return;
        }

        if bridge::is_native_tool_frame(&kind) {
            bridge::forward_tool_frame(&self.store, &self.broadcaster, &self.session_id, frame)
                .await;
            return;
        }

        if kind.is_empty() {
            tracing::warn!(session_id = %self.session_id, "agent frame missing a type tag");
            return;
        }

        let payload = bridge::strip_type(frame);
        match self.store.append_event(&self.session_id, &kind, &payload) {
            Ok(seq) => {
                self.broadcaster
                    .publish(EventEnvelope {
                        seq,
                        kind,
                        payload,
                    })
                    .await;
            }
            Err(error) => {
                tracing::error!(session_id = %self.session_id, %error, "journal append failed");
            }
        }
    }

    /// Terminal transport failure: journal a synthetic `agent_end` so
    /// replay-based reconnects see a clean ending, broadcast it, and move
    /// the session to `error`.
    async fn fail_session(&self, reason: &str) {
        let payload = json!({"success": false, "error": reason});
        match self
            .store
            .append_event(&self.session_id, event_kind::AGENT_END, &payload)
        {
            Ok(seq) => {
                self.broadcaster
                    .publish(EventEnvelope {
                        seq,
                        kind: event_kind::AGENT_END.to_string(),
                        payload,
                    })
                    .await;
            }
            Err(error) => {
                tracing::error!(session_id = %self.session_id, %error, "failed to journal agent_end");
            }
        }

        if let Err(error) = self.store.mark_session_error(&self.session_id) {
            tracing::error!(session_id = %self.session_id, %error, "failed to mark session error");
        }

        self.pending.lock().await.fail_all(RpcError::ConnectionLost);
        self.cancel.cancel();
    }
}

/// One supervisor per live session, created on first subscriber or first
/// command.
pub struct SupervisorRegistry {
    store: Store,
    manager: Arc<SandboxManager>,
    broadcasters: Arc<BroadcasterRegistry>,
    config: SupervisorConfig,
    inner: Mutex<HashMap<String, Arc<ChannelSupervisor>>>,
}

impl SupervisorRegistry {
    pub fn new(
        store: Store,
        manager: Arc<SandboxManager>,
        broadcasters: Arc<BroadcasterRegistry>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            manager,
            broadcasters,
            config,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(
        &self,
        session_id: &str,
    ) -> Result<Arc<ChannelSupervisor>, ServerError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.get(session_id) {
            if !existing.is_cancelled() {
                return Ok(existing.clone());
            }
            inner.remove(session_id);
        }

        let session = self.store.get_session(session_id)?;
        if session.status == SessionStatus::Deleted {
            return Err(ServerError::not_found(format!("session {session_id}")));
        }
        let binding = session.sandbox.ok_or_else(|| {
            ServerError::Conflict(format!(
                "session {session_id} has no sandbox (status {})",
                session.status
            ))
        })?;

        let (handle, channel) = self
            .manager
            .attach_session(binding.provider_type, &binding.provider_sandbox_id)
            .await?;
        let broadcaster = self.broadcasters.get(session_id).await;

        let supervisor = ChannelSupervisor::spawn(
            session_id.to_string(),
            self.store.clone(),
            broadcaster,
            self.manager.clone(),
            (binding.provider_type, binding.provider_sandbox_id),
            handle,
            channel,
            self.config.clone(),
        );
        inner.insert(session_id.to_string(), supervisor.clone());
        Ok(supervisor)
    }

    pub async fn remove(&self, session_id: &str) {
        let supervisor = {
            let mut inner = self.inner.lock().await;
            inner.remove(session_id)
        };
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
    }
}
