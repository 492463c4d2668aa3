//! Two logical topics, both in-process: a per-agent streaming bus for live LLM output, and a
//! single board-change broadcast for UI refresh notifications.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tayfa_types::StreamEvent;
use tokio::sync::{broadcast, RwLock};

/// Capacity of each per-agent broadcast channel. `tokio::sync::broadcast` already implements
/// drop-oldest-on-full for lagging subscribers, which is exactly the policy this bus needs.
const AGENT_CHANNEL_CAPACITY: usize = 1024;
/// Capacity of the board-change broadcast channel.
const BOARD_CHANNEL_CAPACITY: usize = 256;
/// Maximum number of events retained in a per-agent replay buffer.
const REPLAY_BUFFER_CAPACITY: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct BoardChanged {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub ts: i64,
}

impl BoardChanged {
    fn now() -> Self {
        Self {
            kind: "board_changed",
            ts: chrono::Utc::now().timestamp(),
        }
    }
}

/// Single broadcast topic: any state mutation publishes a `board_changed` notification.
/// Events are coalescible by design — a subscriber that hasn't drained may see one event
/// instead of several, which is correct because the semantic is "something changed, refetch".
#[derive(Clone)]
pub struct BoardBus {
    tx: broadcast::Sender<BoardChanged>,
}

impl BoardBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BOARD_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish_changed(&self) {
        let _ = self.tx.send(BoardChanged::now());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardChanged> {
        self.tx.subscribe()
    }
}

impl Default for BoardBus {
    fn default() -> Self {
        Self::new()
    }
}

struct AgentChannel {
    tx: broadcast::Sender<StreamEvent>,
    replay: Vec<StreamEvent>,
}

impl AgentChannel {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(AGENT_CHANNEL_CAPACITY);
        Self {
            tx,
            replay: Vec::new(),
        }
    }
}

/// Per-agent stream bus. Keyed by agent name; each agent gets its own broadcast channel plus
/// a bounded replay buffer of the current/most recent run so a subscriber that attaches
/// shortly after a run starts still sees the whole run.
#[derive(Clone)]
pub struct AgentStreamBus {
    channels: Arc<RwLock<HashMap<String, AgentChannel>>>,
}

impl AgentStreamBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Called by the agent runner at the start of each invocation: resets the replay buffer
    /// so a new run doesn't get spliced onto the tail of a stale one.
    pub async fn start_run(&self, agent: &str) {
        let mut channels = self.channels.write().await;
        channels.insert(agent.to_string(), AgentChannel::new());
    }

    /// Publishes is non-blocking: a full subscriber buffer only drops that subscriber's
    /// oldest unread event, never blocks the publisher.
    pub async fn publish(&self, agent: &str, event: StreamEvent) {
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(agent.to_string())
            .or_insert_with(AgentChannel::new);
        channel.replay.push(event.clone());
        if channel.replay.len() > REPLAY_BUFFER_CAPACITY {
            let overflow = channel.replay.len() - REPLAY_BUFFER_CAPACITY;
            channel.replay.drain(0..overflow);
        }
        let _ = channel.tx.send(event);
    }

    /// Subscribes to `agent`'s stream, returning the current replay buffer (oldest first)
    /// together with a receiver for events published from this point forward. Returns `None`
    /// when `agent` has no channel at all — i.e. `start_run`/`publish` has never been called
    /// for it — so callers can tell "no such run" apart from "run started, nothing published
    /// yet" (whose replay buffer is merely empty, not absent).
    pub async fn subscribe(&self, agent: &str) -> Option<(Vec<StreamEvent>, broadcast::Receiver<StreamEvent>)> {
        let channels = self.channels.read().await;
        channels.get(agent).map(|channel| (channel.replay.clone(), channel.tx.subscribe()))
    }
}

impl Default for AgentStreamBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_sees_full_replay_buffer() {
        let bus = AgentStreamBus::new();
        bus.start_run("dev").await;
        bus.publish("dev", StreamEvent::Assistant { text: Some("hi".into()) })
            .await;
        bus.publish("dev", StreamEvent::StreamEnd).await;

        let (replay, _rx) = bus.subscribe("dev").await.expect("agent has a channel");
        assert_eq!(replay.len(), 2);
        assert!(matches!(replay[1], StreamEvent::StreamEnd));
    }

    #[tokio::test]
    async fn subscribing_before_run_yields_same_sequence_as_after() {
        let bus = AgentStreamBus::new();
        bus.start_run("dev").await;
        let (_replay, mut early_rx) = bus.subscribe("dev").await.expect("agent has a channel");

        bus.publish("dev", StreamEvent::Assistant { text: Some("a".into()) })
            .await;
        bus.publish("dev", StreamEvent::StreamEnd).await;

        let (late_replay, _late_rx) = bus.subscribe("dev").await.expect("agent has a channel");

        let mut early_seen = Vec::new();
        for _ in 0..2 {
            early_seen.push(early_rx.recv().await.unwrap());
        }

        assert_eq!(early_seen.len(), late_replay.len());
    }

    #[tokio::test]
    async fn subscribing_to_unknown_agent_returns_none() {
        let bus = AgentStreamBus::new();
        assert!(bus.subscribe("ghost").await.is_none());
    }

    #[tokio::test]
    async fn board_bus_publishes_without_blocking_when_no_subscribers() {
        let bus = BoardBus::new();
        bus.publish_changed();
        let mut rx = bus.subscribe();
        bus.publish_changed();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "board_changed");
    }
}
