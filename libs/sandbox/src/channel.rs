//! The duplex line-delimited JSON channel between the relay and the agent.
//!
//! A sandbox has at most one live channel. `attach()` steals stdin: the
//! previous channel receives exactly one [`ChannelEvent::Closed`] with
//! [`CloseReason::Reattached`] and every later `send` on it is silently
//! dropped. This keeps two supervisors from racing on the agent's stdin.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

/// Default per-channel inbound buffer (lines from the agent).
const CHANNEL_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One stdout line from the agent, newline stripped.
    Line(String),
    /// The channel is gone. Fires at most once per channel.
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The agent process exited or its transport collapsed.
    PeerExit,
    /// A newer `attach()` took over stdin.
    Reattached,
    /// `close()` was called on this channel.
    Explicit,
}

struct HubState {
    generation: u64,
    stdin_tx: Option<mpsc::Sender<String>>,
    stdin_open: bool,
    subscriber: Option<mpsc::Sender<ChannelEvent>>,
    peer_closed: bool,
}

/// Owned by a sandbox handle; survives process re-wiring and channel churn.
pub struct ChannelHub {
    state: Mutex<HubState>,
}

impl ChannelHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                generation: 0,
                stdin_tx: None,
                stdin_open: false,
                subscriber: None,
                peer_closed: false,
            }),
        })
    }

    /// Install the sender feeding the agent's stdin. Called by the provider
    /// whenever it (re)wires the underlying process.
    pub async fn wire_stdin(&self, tx: mpsc::Sender<String>) {
        let mut state = self.state.lock().await;
        state.stdin_tx = Some(tx);
        state.peer_closed = false;
    }

    /// Create a fresh channel, closing any previous one.
    pub async fn attach(self: &Arc<Self>) -> AgentChannel {
        let mut state = self.state.lock().await;
        if let Some(prev) = state.subscriber.take() {
            let _ = prev.try_send(ChannelEvent::Closed(CloseReason::Reattached));
        }
        state.generation += 1;
        state.stdin_open = true;

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        if state.peer_closed {
            // Attaching to a dead peer yields an immediately-closed channel.
            let _ = tx.try_send(ChannelEvent::Closed(CloseReason::PeerExit));
        } else {
            state.subscriber = Some(tx);
        }

        AgentChannel {
            hub: self.clone(),
            generation: state.generation,
            events: rx,
        }
    }

    /// Deliver one agent stdout line to the current channel, if any.
    /// Lines arriving with no channel attached are dropped.
    pub async fn dispatch_line(&self, line: String) {
        let subscriber = {
            let state = self.state.lock().await;
            state.subscriber.clone()
        };
        if let Some(subscriber) = subscriber {
            let _ = subscriber.send(ChannelEvent::Line(line)).await;
        }
    }

    /// The agent process is gone: notify the current channel and drop the
    /// stdin wiring.
    pub async fn notify_peer_exit(&self) {
        let mut state = self.state.lock().await;
        state.peer_closed = true;
        state.stdin_tx = None;
        state.stdin_open = false;
        if let Some(subscriber) = state.subscriber.take() {
            let _ = subscriber.try_send(ChannelEvent::Closed(CloseReason::PeerExit));
        }
    }

    /// Whether the peer side is currently wired.
    pub async fn peer_alive(&self) -> bool {
        let state = self.state.lock().await;
        !state.peer_closed && state.stdin_tx.is_some()
    }

    async fn write_line(&self, generation: u64, line: String) {
        let tx = {
            let state = self.state.lock().await;
            if state.generation != generation || !state.stdin_open || state.peer_closed {
                return;
            }
            state.stdin_tx.clone()
        };
        if let Some(tx) = tx {
            let _ = tx.send(line).await;
        }
    }

    async fn close_channel(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        state.stdin_open = false;
        if let Some(subscriber) = state.subscriber.take() {
            let _ = subscriber.try_send(ChannelEvent::Closed(CloseReason::Explicit));
        }
    }
}

/// One attached channel. Dropping it without `close()` leaves the hub
/// untouched; the next `attach()` reclaims stdin either way.
pub struct AgentChannel {
    hub: Arc<ChannelHub>,
    generation: u64,
    events: mpsc::Receiver<ChannelEvent>,
}

impl AgentChannel {
    /// Write one line to the agent's stdin. Silently dropped once this
    /// channel has been closed or superseded.
    pub async fn send(&self, line: impl Into<String>) {
        self.hub.write_line(self.generation, line.into()).await;
    }

    /// Next line or close notification. `None` after the close notification
    /// has been consumed.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Close the agent's stdin without killing the sandbox.
    pub async fn close(&self) {
        self.hub.close_channel(self.generation).await;
    }

    /// Detached write half, bound to this channel's generation. Goes mute
    /// together with the channel it came from.
    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            hub: self.hub.clone(),
            generation: self.generation,
        }
    }
}

/// Write-only half of a channel. Subject to the same single-writer rules:
/// a re-attach silently mutes every sender of the superseded generation.
#[derive(Clone)]
pub struct ChannelSender {
    hub: Arc<ChannelHub>,
    generation: u64,
}

impl ChannelSender {
    pub async fn send(&self, line: impl Into<String>) {
        self.hub.write_line(self.generation, line.into()).await;
    }

    pub async fn close(&self) {
        self.hub.close_channel(self.generation).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn wired_hub() -> (Arc<ChannelHub>, mpsc::Receiver<String>) {
        let hub = ChannelHub::new();
        let (tx, rx) = mpsc::channel(16);
        hub.wire_stdin(tx).await;
        (hub, rx)
    }

    #[tokio::test]
    async fn lines_flow_to_the_attached_channel() {
        let (hub, mut stdin) = wired_hub().await;
        let mut channel = hub.attach().await;

        channel.send(r#"{"type":"prompt"}"#).await;
        assert_eq!(stdin.recv().await.as_deref(), Some(r#"{"type":"prompt"}"#));

        hub.dispatch_line(r#"{"type":"agent_start"}"#.to_string()).await;
        assert_eq!(
            channel.recv().await,
            Some(ChannelEvent::Line(r#"{"type":"agent_start"}"#.to_string()))
        );
    }

    #[tokio::test]
    async fn reattach_steals_stdin() {
        let (hub, mut stdin) = wired_hub().await;
        let mut first = hub.attach().await;
        let second = hub.attach().await;

        // The first channel gets exactly one close notification.
        assert_eq!(
            first.recv().await,
            Some(ChannelEvent::Closed(CloseReason::Reattached))
        );
        assert_eq!(first.recv().await, None);

        // Stale sends are dropped; the new channel still writes.
        first.send("from first").await;
        second.send("from second").await;
        assert_eq!(stdin.recv().await.as_deref(), Some("from second"));
        assert!(stdin.try_recv().is_err());
    }

    #[tokio::test]
    async fn explicit_close_notifies_and_mutes() {
        let (hub, mut stdin) = wired_hub().await;
        let mut channel = hub.attach().await;

        channel.close().await;
        assert_eq!(
            channel.recv().await,
            Some(ChannelEvent::Closed(CloseReason::Explicit))
        );

        channel.send("after close").await;
        assert!(stdin.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_exit_notifies_current_channel() {
        let (hub, _stdin) = wired_hub().await;
        let mut channel = hub.attach().await;

        hub.notify_peer_exit().await;
        assert_eq!(
            channel.recv().await,
            Some(ChannelEvent::Closed(CloseReason::PeerExit))
        );
        assert!(!hub.peer_alive().await);
    }

    #[tokio::test]
    async fn attach_after_peer_exit_yields_closed_channel() {
        let (hub, _stdin) = wired_hub().await;
        hub.notify_peer_exit().await;

        let mut channel = hub.attach().await;
        assert_eq!(
            channel.recv().await,
            Some(ChannelEvent::Closed(CloseReason::PeerExit))
        );
    }

    #[tokio::test]
    async fn lines_with_no_subscriber_are_dropped() {
        let (hub, _stdin) = wired_hub().await;
        hub.dispatch_line("orphan".to_string()).await;

        let mut channel = hub.attach().await;
        channel.send("ping").await;
        // The orphan line must not be delivered to the new channel.
        hub.dispatch_line("fresh".to_string()).await;
        assert_eq!(
            channel.recv().await,
            Some(ChannelEvent::Line("fresh".to_string()))
        );
    }
}
