//! Per-session fan-out: replay from the journal, then the live tail, with a
//! gap-free cutover.
//!
//! Each subscriber owns a bounded queue. A subscriber is registered with
//! the live tail *before* the journal is read; live events that arrive
//! during replay are buffered and flushed afterwards with every seq at or
//! below the replay end suppressed, so the handoff neither loses nor
//! duplicates an event.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use moor_shared::models::wire::{EventEnvelope, MetaFrame};

use crate::store::{Store, StoreError};

/// Default per-subscriber buffer. A consumer that falls this far behind is
/// lagged out and must reconnect with its last seq.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// A frame on its way to one subscriber.
#[derive(Debug, Clone)]
pub enum OutFrame {
    Meta(MetaFrame),
    Event(EventEnvelope),
    /// Live-only pass-through (native tool frames); carries no seq.
    Passthrough(Value),
}

impl OutFrame {
    pub fn to_json(&self) -> Value {
        match self {
            OutFrame::Meta(frame) => serde_json::to_value(frame).unwrap_or(Value::Null),
            OutFrame::Event(envelope) => serde_json::to_value(envelope).unwrap_or(Value::Null),
            OutFrame::Passthrough(value) => value.clone(),
        }
    }
}

struct SubState {
    queue: VecDeque<OutFrame>,
    /// `Some` while the subscriber is replaying: live frames land here and
    /// are flushed at cutover.
    pending: Option<Vec<OutFrame>>,
    closed: bool,
}

struct SubShared {
    capacity: usize,
    state: std::sync::Mutex<SubState>,
    notify: Notify,
}

impl SubShared {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: std::sync::Mutex::new(SubState {
                queue: VecDeque::new(),
                pending: Some(Vec::new()),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns false once the subscriber is closed (consumer gone or
    /// lagged out) so the broadcaster can prune it.
    fn push_live(&self, frame: OutFrame) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        if let Some(pending) = state.pending.as_mut() {
            pending.push(frame);
            return true;
        }
        let alive = enqueue(&mut state, self.capacity, frame);
        drop(state);
        self.notify.notify_one();
        alive
    }

    /// Direct enqueue from the subscribing task (connected/replay frames).
    fn push_direct(&self, frame: OutFrame) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        enqueue(&mut state, self.capacity, frame);
        drop(state);
        self.notify.notify_one();
    }

    /// Cutover: flush buffered live frames, suppressing any event already
    /// covered by replay.
    fn go_live(&self, suppress_through: i64) {
        let mut state = self.lock();
        let Some(pending) = state.pending.take() else {
            return;
        };
        for frame in pending {
            if state.closed {
                break;
            }
            if let OutFrame::Event(envelope) = &frame {
                if envelope.seq <= suppress_through {
                    continue;
                }
            }
            enqueue(&mut state, self.capacity, frame);
        }
        drop(state);
        self.notify.notify_one();
    }

    fn close(&self, final_frame: Option<OutFrame>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if let Some(frame) = final_frame {
            state.queue.push_back(frame);
        }
        state.closed = true;
        drop(state);
        self.notify.notify_one();
    }
}

/// Bounded enqueue with the lag policy: on overflow, drop the oldest frame,
/// append a synthetic `error("lag")`, and close the stream.
fn enqueue(state: &mut SubState, capacity: usize, frame: OutFrame) -> bool {
    if state.queue.len() >= capacity {
        state.queue.pop_front();
        state.queue.push_back(OutFrame::Meta(MetaFrame::error(
            "lag",
            "subscriber fell behind; reconnect with your last seq",
        )));
        state.closed = true;
        return false;
    }
    state.queue.push_back(frame);
    true
}

/// The consumer half handed to the WebSocket endpoint.
pub struct SubscriberStream {
    shared: Arc<SubShared>,
}

impl SubscriberStream {
    /// Next frame; `None` once the stream is closed and drained.
    pub async fn next(&mut self) -> Option<OutFrame> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                if let Some(frame) = state.queue.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        // Consumer gone: let the broadcaster prune this subscriber.
        self.shared.lock().closed = true;
    }
}

pub struct SessionBroadcaster {
    session_id: String,
    store: Store,
    capacity: usize,
    subscribers: Mutex<Vec<Arc<SubShared>>>,
}

impl SessionBroadcaster {
    pub fn new(session_id: String, store: Store, capacity: usize) -> Self {
        Self {
            session_id,
            store,
            capacity,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe with a `lastSeq` cursor: emits `connected`, the replay
    /// window if any, then the live tail.
    pub async fn subscribe(&self, last_seq: i64) -> Result<SubscriberStream, StoreError> {
        let shared = Arc::new(SubShared::new(self.capacity));

        // Register the live cursor before reading the journal.
        {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.push(shared.clone());
        }

        let current_last = self.store.last_seq(&self.session_id)?;
        shared.push_direct(OutFrame::Meta(MetaFrame::Connected {
            session_id: self.session_id.clone(),
            last_seq: current_last,
        }));

        if last_seq < current_last {
            shared.push_direct(OutFrame::Meta(MetaFrame::ReplayStart {
                from: last_seq + 1,
                to: current_last,
            }));
            let entries = self
                .store
                .read_events_after(&self.session_id, last_seq, None)?;
            for entry in entries {
                if entry.seq <= current_last {
                    shared.push_direct(OutFrame::Event(entry.envelope()));
                }
            }
            shared.push_direct(OutFrame::Meta(MetaFrame::ReplayEnd));
        }

        shared.go_live(current_last);
        Ok(SubscriberStream { shared })
    }

    /// Deliver a freshly journaled event to every live subscriber.
    pub async fn publish(&self, envelope: EventEnvelope) {
        self.fan_out(OutFrame::Event(envelope)).await;
    }

    pub async fn publish_meta(&self, frame: MetaFrame) {
        self.fan_out(OutFrame::Meta(frame)).await;
    }

    /// Live-only forwarding for frames that are never journaled.
    pub async fn publish_passthrough(&self, value: Value) {
        self.fan_out(OutFrame::Passthrough(value)).await;
    }

    async fn fan_out(&self, frame: OutFrame) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|subscriber| subscriber.push_live(frame.clone()));
    }

    pub async fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|subscriber| !subscriber.lock().closed);
        subscribers.len()
    }

    /// Close every subscriber with a final error frame (session teardown).
    pub async fn close_all(&self, code: &str, message: &str) {
        let mut subscribers = self.subscribers.lock().await;
        for subscriber in subscribers.drain(..) {
            subscriber.close(Some(OutFrame::Meta(MetaFrame::error(code, message))));
        }
    }
}

/// Process-wide registry: one broadcaster per session, created lazily,
/// surviving subscriber churn.
pub struct BroadcasterRegistry {
    store: Store,
    capacity: usize,
    inner: Mutex<HashMap<String, Arc<SessionBroadcaster>>>,
}

impl BroadcasterRegistry {
    pub fn new(store: Store, capacity: usize) -> Self {
        Self {
            store,
            capacity,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, session_id: &str) -> Arc<SessionBroadcaster> {
        let mut inner = self.inner.lock().await;
        inner
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionBroadcaster::new(
                    session_id.to_string(),
                    self.store.clone(),
                    self.capacity,
                ))
            })
            .clone()
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionBroadcaster>> {
        let mut inner = self.inner.lock().await;
        inner.remove(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use serde_json::json;

    async fn append_and_publish(
        store: &Store,
        broadcaster: &SessionBroadcaster,
        session_id: &str,
        kind: &str,
    ) -> i64 {
        let payload = json!({});
        let seq = store
            .append_event(session_id, kind, &payload)
            .expect("append");
        broadcaster
            .publish(EventEnvelope {
                seq,
                kind: kind.to_string(),
                payload,
            })
            .await;
        seq
    }

    #[tokio::test]
    async fn fresh_subscriber_gets_connected_and_no_replay() {
        let store = test_store();
        let broadcaster =
            SessionBroadcaster::new("s-1".into(), store.clone(), DEFAULT_SUBSCRIBER_BUFFER);

        let mut stream = broadcaster.subscribe(0).await.expect("subscribe");
        match stream.next().await {
            Some(OutFrame::Meta(MetaFrame::Connected { last_seq, .. })) => {
                assert_eq!(last_seq, 0)
            }
            other => panic!("expected connected frame, got {other:?}"),
        }

        append_and_publish(&store, &broadcaster, "s-1", "agent_start").await;
        match stream.next().await {
            Some(OutFrame::Event(envelope)) => {
                assert_eq!(envelope.seq, 1);
                assert_eq!(envelope.kind, "agent_start");
            }
            other => panic!("expected live event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_subscriber_replays_then_tails() {
        let store = test_store();
        let broadcaster =
            SessionBroadcaster::new("s-1".into(), store.clone(), DEFAULT_SUBSCRIBER_BUFFER);

        for kind in ["agent_start", "message_start", "message_end"] {
            append_and_publish(&store, &broadcaster, "s-1", kind).await;
        }

        let mut stream = broadcaster.subscribe(1).await.expect("subscribe");

        match stream.next().await {
            Some(OutFrame::Meta(MetaFrame::Connected { last_seq, .. })) => {
                assert_eq!(last_seq, 3)
            }
            other => panic!("expected connected, got {other:?}"),
        }
        match stream.next().await {
            Some(OutFrame::Meta(MetaFrame::ReplayStart { from, to })) => {
                assert_eq!((from, to), (2, 3));
            }
            other => panic!("expected replay_start, got {other:?}"),
        }
        for expected_seq in [2, 3] {
            match stream.next().await {
                Some(OutFrame::Event(envelope)) => assert_eq!(envelope.seq, expected_seq),
                other => panic!("expected replay event, got {other:?}"),
            }
        }
        assert!(matches!(
            stream.next().await,
            Some(OutFrame::Meta(MetaFrame::ReplayEnd))
        ));

        let seq = append_and_publish(&store, &broadcaster, "s-1", "agent_end").await;
        match stream.next().await {
            Some(OutFrame::Event(envelope)) => assert_eq!(envelope.seq, seq),
            other => panic!("expected live event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cutover_suppresses_events_already_replayed() {
        let store = test_store();
        let broadcaster =
            SessionBroadcaster::new("s-1".into(), store.clone(), DEFAULT_SUBSCRIBER_BUFFER);

        store
            .append_event("s-1", "agent_start", &json!({}))
            .expect("append");

        // A live publish of seq 1 racing the replay of seq 1 must not be
        // delivered twice. Simulate the race through the internal hooks the
        // subscribe path uses.
        let shared = Arc::new(SubShared::new(DEFAULT_SUBSCRIBER_BUFFER));
        assert!(shared.push_live(OutFrame::Event(EventEnvelope {
            seq: 1,
            kind: "agent_start".into(),
            payload: json!({}),
        })));
        shared.push_direct(OutFrame::Event(EventEnvelope {
            seq: 1,
            kind: "agent_start".into(),
            payload: json!({}),
        }));
        shared.go_live(1);

        let mut stream = SubscriberStream { shared };
        let first = stream.next().await;
        assert!(matches!(first, Some(OutFrame::Event(ref e)) if e.seq == 1));

        // Nothing further: the buffered live copy was suppressed.
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn lagging_subscriber_is_closed_with_an_error() {
        let store = test_store();
        let broadcaster = SessionBroadcaster::new("s-1".into(), store.clone(), 2);

        let mut slow = broadcaster.subscribe(0).await.expect("subscribe slow");
        let mut fast = broadcaster.subscribe(0).await.expect("subscribe fast");

        // connected frames
        assert!(matches!(slow.next().await, Some(OutFrame::Meta(_))));
        assert!(matches!(fast.next().await, Some(OutFrame::Meta(_))));

        let mut fast_seqs = Vec::new();
        for n in 1..=5 {
            let seq = append_and_publish(&store, &broadcaster, "s-1", "tick").await;
            assert_eq!(seq, n);
            // Fast consumer keeps up.
            if let Some(OutFrame::Event(envelope)) = fast.next().await {
                fast_seqs.push(envelope.seq);
            }
        }
        assert_eq!(fast_seqs, vec![1, 2, 3, 4, 5]);

        // Slow consumer: some prefix of events, then the lag error, then end.
        let mut saw_lag = false;
        let mut last_event_seq = 0;
        while let Some(frame) = slow.next().await {
            match frame {
                OutFrame::Event(envelope) => {
                    assert!(envelope.seq > last_event_seq, "in-order delivery");
                    last_event_seq = envelope.seq;
                }
                OutFrame::Meta(MetaFrame::Error { code, .. }) => {
                    assert_eq!(code, "lag");
                    saw_lag = true;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(saw_lag);
        assert_eq!(broadcaster.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn close_all_sends_final_error() {
        let store = test_store();
        let broadcaster =
            SessionBroadcaster::new("s-1".into(), store.clone(), DEFAULT_SUBSCRIBER_BUFFER);
        let mut stream = broadcaster.subscribe(0).await.expect("subscribe");
        assert!(matches!(stream.next().await, Some(OutFrame::Meta(_))));

        broadcaster.close_all("session_stopped", "session deleted").await;
        match stream.next().await {
            Some(OutFrame::Meta(MetaFrame::Error { code, .. })) => {
                assert_eq!(code, "session_stopped")
            }
            other => panic!("expected error frame, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }
}
