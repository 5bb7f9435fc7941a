//! Session-scoped publish/subscribe transport.
//!
//! A `Channel` carries named JSON messages on named topics and retains a
//! short bounded history per topic for cold-start reconstruction. Delivery
//! is at-least-once with no ordering guarantee; consumers treat the most
//! recent observed entry as latest.
//!
//! `LocalChannel` is the in-memory implementation used in tests and
//! single-process deployments; a network-backed implementation plugs in
//! behind the same trait.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Per-topic broadcast capacity. Slow receivers that fall behind skip
/// messages (`RecvError::Lagged`).
const BROADCAST_CAPACITY: usize = 64;

/// Retained messages per topic, oldest evicted first.
pub const HISTORY_RETENTION: usize = 50;

/// One named message on a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    /// Event name, e.g. "arrangement-revealed"
    pub event: String,
    pub payload: serde_json::Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

impl ChannelMessage {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
            published_at: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel transport error: {0}")]
    Transport(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Publish/subscribe transport with bounded retained history.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn publish(&self, topic: &str, message: ChannelMessage) -> ChannelResult<()>;

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<ChannelMessage>;

    /// Up to `limit` most recent messages, oldest first.
    async fn history(&self, topic: &str, limit: usize) -> ChannelResult<Vec<ChannelMessage>>;
}

#[derive(Debug)]
struct TopicState {
    sender: broadcast::Sender<ChannelMessage>,
    history: VecDeque<ChannelMessage>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            sender: broadcast::channel(BROADCAST_CAPACITY).0,
            history: VecDeque::new(),
        }
    }
}

/// In-memory channel for tests and single-process contexts.
#[derive(Debug, Default)]
pub struct LocalChannel {
    topics: parking_lot::RwLock<HashMap<String, TopicState>>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn publish(&self, topic: &str, message: ChannelMessage) -> ChannelResult<()> {
        let mut guard = self.topics.write();
        let state = guard.entry(topic.to_string()).or_insert_with(TopicState::new);
        state.history.push_back(message.clone());
        while state.history.len() > HISTORY_RETENTION {
            state.history.pop_front();
        }
        // No live subscribers is fine; history still records the message.
        let _ = state.sender.send(message);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<ChannelMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(TopicState::new)
            .sender
            .subscribe()
    }

    async fn history(&self, topic: &str, limit: usize) -> ChannelResult<Vec<ChannelMessage>> {
        let guard = self.topics.read();
        Ok(match guard.get(topic) {
            Some(state) => {
                let skip = state.history.len().saturating_sub(limit);
                state.history.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        })
    }
}

/// A channel handle bound to one session: topic names are namespaced by the
/// session code, so sessions never see each other's traffic.
#[derive(Debug)]
pub struct SessionChannel<C: Channel> {
    session_code: String,
    inner: Arc<C>,
}

impl<C: Channel> Clone for SessionChannel<C> {
    fn clone(&self) -> Self {
        Self {
            session_code: self.session_code.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Channel> SessionChannel<C> {
    pub fn new(session_code: impl Into<String>, inner: Arc<C>) -> Self {
        Self {
            session_code: session_code.into(),
            inner,
        }
    }

    pub fn session_code(&self) -> &str {
        &self.session_code
    }

    fn scoped(&self, topic: &str) -> String {
        format!("session/{}/{}", self.session_code, topic)
    }

    pub async fn publish(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> ChannelResult<()> {
        self.inner
            .publish(&self.scoped(topic), ChannelMessage::new(event, payload))
            .await
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<ChannelMessage> {
        self.inner.subscribe(&self.scoped(topic))
    }

    pub async fn history(&self, topic: &str, limit: usize) -> ChannelResult<Vec<ChannelMessage>> {
        self.inner.history(&self.scoped(topic), limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn local_channel_round_trip() {
        let channel = LocalChannel::new();
        let mut rx = channel.subscribe("reveals");

        channel
            .publish("reveals", ChannelMessage::new("ping", serde_json::json!({"n": 1})))
            .await
            .expect("publish ok");

        let msg = rx.recv().await.expect("receive ok");
        assert_eq!(msg.event, "ping");
        assert_eq!(msg.payload["n"], 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_still_retained() {
        let channel = LocalChannel::new();
        channel
            .publish("reveals", ChannelMessage::new("ping", serde_json::json!({})))
            .await
            .expect("publish ok");

        let history = channel.history("reveals", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event, "ping");
    }

    #[tokio::test]
    async fn history_is_bounded_and_newest_last() {
        let channel = LocalChannel::new();
        for i in 0..(HISTORY_RETENTION + 10) {
            channel
                .publish("reveals", ChannelMessage::new("tick", serde_json::json!({"i": i})))
                .await
                .unwrap();
        }

        let full = channel.history("reveals", usize::MAX).await.unwrap();
        assert_eq!(full.len(), HISTORY_RETENTION);
        assert_eq!(full.last().unwrap().payload["i"], HISTORY_RETENTION + 9);

        let recent = channel.history("reveals", 5).await.unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].payload["i"], HISTORY_RETENTION + 5);
    }

    #[tokio::test]
    async fn history_of_unknown_topic_is_empty() {
        let channel = LocalChannel::new();
        assert!(channel.history("nope", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sessions_are_namespaced() {
        let inner = Arc::new(LocalChannel::new());
        let session_a = SessionChannel::new("ABCD", Arc::clone(&inner));
        let session_b = SessionChannel::new("WXYZ", Arc::clone(&inner));

        let mut rx_a = session_a.subscribe("reveals");
        let mut rx_b = session_b.subscribe("reveals");

        session_a
            .publish("reveals", "hello", serde_json::json!({"from": "a"}))
            .await
            .unwrap();

        let msg = rx_a.recv().await.unwrap();
        assert_eq!(msg.payload["from"], "a");
        // Session B sees nothing
        assert!(matches!(
            rx_b.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
        assert!(session_b.history("reveals", 10).await.unwrap().is_empty());
    }
}
