//! Viewer presence tracking.
//!
//! Tracks who is watching whose revealed arrangement: join/leave intents, a
//! per-arrangement viewer cap, periodic liveness heartbeats, and removal of
//! viewers that go silent. Presence maps are best-effort mirrors built from
//! `viewers` topic events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::channel::{Channel, ChannelError, ChannelMessage, SessionChannel};

use super::{
    SyncError, SyncResult, ViewerActivityPayload, ViewerJoinedPayload, ViewerLeftPayload,
    EVENT_VIEWER_ACTIVITY, EVENT_VIEWER_JOINED, EVENT_VIEWER_LEFT, TOPIC_VIEWERS,
};

/// Hard cap of simultaneous viewers per revealed arrangement.
pub const MAX_VIEWERS_PER_ARRANGEMENT: usize = 10;

/// How often a viewer republishes liveness.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A viewer with no activity for this long is treated as disconnected.
pub const VIEWER_TIMEOUT: Duration = Duration::from_secs(45);

/// Who this participant presents as when viewing others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerIdentity {
    pub participant_id: String,
    pub name: String,
    pub emoji: String,
    pub color: String,
}

/// One active viewer of one arrangement.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerEntry {
    pub participant_id: String,
    pub name: String,
    pub emoji: String,
    pub color: String,
    pub joined_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
struct TrackedViewer {
    entry: ViewerEntry,
    last_seen: Instant,
}

type ViewersMap = Arc<Mutex<HashMap<String, HashMap<String, TrackedViewer>>>>;
type PresenceCallback = Arc<dyn Fn(Vec<ViewerEntry>) + Send + Sync>;
type CallbackRegistry = Arc<Mutex<HashMap<String, Vec<(u64, PresenceCallback)>>>>;

struct Bound<C: Channel> {
    channel: SessionChannel<C>,
    identity: ViewerIdentity,
    listener: AbortHandle,
}

/// Guard for one presence subscription; dropping it stops the callback.
pub struct PresenceSubscription {
    target: String,
    id: u64,
    callbacks: CallbackRegistry,
}

impl PresenceSubscription {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn unsubscribe(self) {}
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        if let Some(subs) = self.callbacks.lock().get_mut(&self.target) {
            subs.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Tracks viewers per target and manages this participant's own viewing.
pub struct ViewerPresence<C: Channel> {
    transport: Arc<C>,
    bound: Option<Bound<C>>,
    /// Active heartbeat per target this participant is viewing
    heartbeats: HashMap<String, AbortHandle>,
    viewers: ViewersMap,
    callbacks: CallbackRegistry,
    next_subscription_id: u64,
}

impl<C: Channel + 'static> ViewerPresence<C> {
    pub fn new(transport: Arc<C>) -> Self {
        Self {
            transport,
            bound: None,
            heartbeats: HashMap::new(),
            viewers: Arc::new(Mutex::new(HashMap::new())),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            next_subscription_id: 1,
        }
    }

    /// Bind identity once per session. Re-initializing with the same
    /// identity is a no-op; a different identity tears down and rebinds.
    pub fn initialize_for_session(&mut self, session_code: &str, identity: ViewerIdentity) {
        let already_bound = self
            .bound
            .as_ref()
            .is_some_and(|b| b.channel.session_code() == session_code && b.identity == identity);
        if already_bound {
            return;
        }
        if self.bound.is_some() {
            self.teardown();
        }

        let channel = SessionChannel::new(session_code, Arc::clone(&self.transport));
        let rx = channel.subscribe(TOPIC_VIEWERS);
        let listener = spawn_presence_listener(rx, Arc::clone(&self.viewers), Arc::clone(&self.callbacks));
        self.bound = Some(Bound {
            channel,
            identity,
            listener: listener.abort_handle(),
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.bound.is_some()
    }

    pub fn session_code(&self) -> Option<&str> {
        self.bound.as_ref().map(|b| b.channel.session_code())
    }

    /// Start viewing a target. Fails with a capacity error when the target
    /// already has its maximum viewers; nothing is published in that case.
    pub async fn join_viewer_session(&mut self, target_participant_id: &str) -> SyncResult<()> {
        let bound = self.bound.as_ref().ok_or(SyncError::NotInitialized)?;

        let current = self
            .viewers
            .lock()
            .get(target_participant_id)
            .map(|v| v.len())
            .unwrap_or(0);
        if current >= MAX_VIEWERS_PER_ARRANGEMENT {
            return Err(SyncError::ViewerCapReached { max: MAX_VIEWERS_PER_ARRANGEMENT });
        }

        let payload = ViewerJoinedPayload {
            viewer_id: bound.identity.participant_id.clone(),
            viewer_name: bound.identity.name.clone(),
            viewer_emoji: bound.identity.emoji.clone(),
            viewer_color: bound.identity.color.clone(),
            target_participant_id: target_participant_id.to_string(),
            joined_at: Utc::now(),
        };
        publish(&bound.channel, EVENT_VIEWER_JOINED, &payload).await?;

        let heartbeat = spawn_heartbeat(
            bound.channel.clone(),
            bound.identity.participant_id.clone(),
            target_participant_id.to_string(),
        );
        if let Some(previous) = self
            .heartbeats
            .insert(target_participant_id.to_string(), heartbeat.abort_handle())
        {
            previous.abort();
        }
        Ok(())
    }

    /// Stop viewing a target. No-op when not currently joined.
    pub async fn leave_viewer_session(&mut self, target_participant_id: &str) -> SyncResult<()> {
        let Some(heartbeat) = self.heartbeats.remove(target_participant_id) else {
            return Ok(());
        };
        heartbeat.abort();

        let bound = self.bound.as_ref().ok_or(SyncError::NotInitialized)?;
        let payload = ViewerLeftPayload {
            viewer_id: bound.identity.participant_id.clone(),
            target_participant_id: target_participant_id.to_string(),
        };
        publish(&bound.channel, EVENT_VIEWER_LEFT, &payload).await
    }

    /// Subscribe to a target's viewer list. The callback receives a fresh
    /// snapshot (sorted by join time) on every change.
    pub fn subscribe_to_viewer_presence(
        &mut self,
        target_participant_id: &str,
        on_update: impl Fn(Vec<ViewerEntry>) + Send + Sync + 'static,
    ) -> PresenceSubscription {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.callbacks
            .lock()
            .entry(target_participant_id.to_string())
            .or_default()
            .push((id, Arc::new(on_update)));
        PresenceSubscription {
            target: target_participant_id.to_string(),
            id,
            callbacks: Arc::clone(&self.callbacks),
        }
    }

    /// Current viewers of a target, sorted by join time.
    pub fn viewers_of(&self, target_participant_id: &str) -> Vec<ViewerEntry> {
        self.viewers
            .lock()
            .get(target_participant_id)
            .map(snapshot)
            .unwrap_or_default()
    }

    /// Drop viewers that have gone silent past the liveness timeout,
    /// notifying subscribers of every affected target.
    pub fn expire_stale(&self) -> usize {
        self.expire_stale_at(Instant::now())
    }

    pub(crate) fn expire_stale_at(&self, now: Instant) -> usize {
        let mut expired = 0;
        let mut touched = Vec::new();
        {
            let mut viewers = self.viewers.lock();
            for (target, entries) in viewers.iter_mut() {
                let before = entries.len();
                entries.retain(|_, tracked| now.duration_since(tracked.last_seen) < VIEWER_TIMEOUT);
                if entries.len() != before {
                    expired += before - entries.len();
                    touched.push((target.clone(), snapshot(entries)));
                }
            }
        }
        for (target, snapshot) in touched {
            notify(&self.callbacks, &target, snapshot);
        }
        expired
    }

    /// Tear everything down and return to the uninitialized state.
    pub fn cleanup(&mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        for (_, heartbeat) in self.heartbeats.drain() {
            heartbeat.abort();
        }
        if let Some(bound) = self.bound.take() {
            bound.listener.abort();
        }
        self.viewers.lock().clear();
        self.callbacks.lock().clear();
    }
}

impl<C: Channel> Drop for ViewerPresence<C> {
    fn drop(&mut self) {
        for (_, heartbeat) in self.heartbeats.drain() {
            heartbeat.abort();
        }
        if let Some(bound) = self.bound.take() {
            bound.listener.abort();
        }
    }
}

async fn publish<C: Channel, T: serde::Serialize>(
    channel: &SessionChannel<C>,
    event: &str,
    payload: &T,
) -> SyncResult<()> {
    let value =
        serde_json::to_value(payload).map_err(|err| ChannelError::Transport(err.to_string()))?;
    channel.publish(TOPIC_VIEWERS, event, value).await?;
    Ok(())
}

fn spawn_heartbeat<C: Channel + 'static>(
    channel: SessionChannel<C>,
    viewer_id: String,
    target_participant_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            let payload = ViewerActivityPayload {
                viewer_id: viewer_id.clone(),
                target_participant_id: target_participant_id.clone(),
                timestamp: Utc::now(),
                is_active: true,
            };
            let value = match serde_json::to_value(&payload) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if let Err(err) = channel.publish(TOPIC_VIEWERS, EVENT_VIEWER_ACTIVITY, value).await {
                tracing::warn!(
                    target: "cardsort.presence",
                    viewer = %viewer_id,
                    error = %err,
                    "heartbeat publish failed"
                );
            }
        }
    })
}

fn spawn_presence_listener(
    mut rx: tokio::sync::broadcast::Receiver<ChannelMessage>,
    viewers: ViewersMap,
    callbacks: CallbackRegistry,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            apply_presence_event(&viewers, &callbacks, &msg);
        }
    })
}

fn apply_presence_event(viewers: &ViewersMap, callbacks: &CallbackRegistry, msg: &ChannelMessage) {
    let (target, snapshot) = match msg.event.as_str() {
        EVENT_VIEWER_JOINED => {
            let Ok(payload) = serde_json::from_value::<ViewerJoinedPayload>(msg.payload.clone())
            else {
                return;
            };
            let mut viewers = viewers.lock();
            let entries = viewers.entry(payload.target_participant_id.clone()).or_default();
            entries.insert(
                payload.viewer_id.clone(),
                TrackedViewer {
                    entry: ViewerEntry {
                        participant_id: payload.viewer_id,
                        name: payload.viewer_name,
                        emoji: payload.viewer_emoji,
                        color: payload.viewer_color,
                        joined_at: payload.joined_at,
                        is_active: true,
                    },
                    last_seen: Instant::now(),
                },
            );
            (payload.target_participant_id, snapshot(entries))
        }
        EVENT_VIEWER_LEFT => {
            let Ok(payload) = serde_json::from_value::<ViewerLeftPayload>(msg.payload.clone())
            else {
                return;
            };
            let mut viewers = viewers.lock();
            let Some(entries) = viewers.get_mut(&payload.target_participant_id) else {
                return;
            };
            entries.remove(&payload.viewer_id);
            (payload.target_participant_id, snapshot(entries))
        }
        EVENT_VIEWER_ACTIVITY => {
            let Ok(payload) = serde_json::from_value::<ViewerActivityPayload>(msg.payload.clone())
            else {
                return;
            };
            let mut viewers = viewers.lock();
            let Some(tracked) = viewers
                .get_mut(&payload.target_participant_id)
                .and_then(|entries| entries.get_mut(&payload.viewer_id))
            else {
                return;
            };
            tracked.last_seen = Instant::now();
            tracked.entry.is_active = payload.is_active;
            return; // liveness refresh is not a membership change
        }
        _ => return,
    };
    notify(callbacks, &target, snapshot);
}

fn snapshot(entries: &HashMap<String, TrackedViewer>) -> Vec<ViewerEntry> {
    let mut list: Vec<ViewerEntry> = entries.values().map(|t| t.entry.clone()).collect();
    list.sort_by(|a, b| {
        a.joined_at
            .cmp(&b.joined_at)
            .then_with(|| a.participant_id.cmp(&b.participant_id))
    });
    list
}

fn notify(callbacks: &CallbackRegistry, target: &str, snapshot: Vec<ViewerEntry>) {
    let subs: Vec<PresenceCallback> = callbacks
        .lock()
        .get(target)
        .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
        .unwrap_or_default();
    for callback in subs {
        callback(snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalChannel;
    use pretty_assertions::assert_eq;

    fn identity(id: &str) -> ViewerIdentity {
        ViewerIdentity {
            participant_id: id.to_string(),
            name: id.to_uppercase(),
            emoji: "👀".to_string(),
            color: "#3355ff".to_string(),
        }
    }

    fn joined_payload(viewer: &str, target: &str) -> serde_json::Value {
        serde_json::to_value(ViewerJoinedPayload {
            viewer_id: viewer.to_string(),
            viewer_name: viewer.to_uppercase(),
            viewer_emoji: "👀".to_string(),
            viewer_color: "#000000".to_string(),
            target_participant_id: target.to_string(),
            joined_at: Utc::now(),
        })
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_same_identity_is_noop() {
        let transport = Arc::new(LocalChannel::new());
        let mut presence = ViewerPresence::new(transport);

        presence.initialize_for_session("ABCD", identity("bob"));
        assert_eq!(presence.session_code(), Some("ABCD"));

        presence.initialize_for_session("ABCD", identity("bob"));
        assert_eq!(presence.session_code(), Some("ABCD"));

        // Different session rebinds
        presence.initialize_for_session("WXYZ", identity("bob"));
        assert_eq!(presence.session_code(), Some("WXYZ"));
    }

    #[tokio::test]
    async fn join_requires_initialization() {
        let transport = Arc::new(LocalChannel::new());
        let mut presence = ViewerPresence::new(transport);
        let err = presence.join_viewer_session("alice").await.unwrap_err();
        assert!(matches!(err, SyncError::NotInitialized));
    }

    #[tokio::test(start_paused = true)]
    async fn join_publishes_and_heartbeats() {
        let transport = Arc::new(LocalChannel::new());
        let session = SessionChannel::new("ABCD", Arc::clone(&transport));
        let mut presence = ViewerPresence::new(Arc::clone(&transport));
        presence.initialize_for_session("ABCD", identity("bob"));

        presence.join_viewer_session("alice").await.unwrap();
        let history = session.history(TOPIC_VIEWERS, 50).await.unwrap();
        assert_eq!(history.last().unwrap().event, EVENT_VIEWER_JOINED);

        tokio::time::sleep(HEARTBEAT_INTERVAL + Duration::from_secs(1)).await;
        let history = session.history(TOPIC_VIEWERS, 50).await.unwrap();
        let beats = history
            .iter()
            .filter(|m| m.event == EVENT_VIEWER_ACTIVITY)
            .count();
        assert!(beats >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eleventh_viewer_is_rejected() {
        let transport = Arc::new(LocalChannel::new());
        let session = SessionChannel::new("ABCD", Arc::clone(&transport));
        let mut presence = ViewerPresence::new(Arc::clone(&transport));
        presence.initialize_for_session("ABCD", identity("bob"));

        for i in 0..MAX_VIEWERS_PER_ARRANGEMENT {
            session
                .publish(
                    TOPIC_VIEWERS,
                    EVENT_VIEWER_JOINED,
                    joined_payload(&format!("v-{}", i), "alice"),
                )
                .await
                .unwrap();
        }
        settle().await;
        assert_eq!(presence.viewers_of("alice").len(), MAX_VIEWERS_PER_ARRANGEMENT);

        let err = presence.join_viewer_session("alice").await.unwrap_err();
        assert!(matches!(err, SyncError::ViewerCapReached { max: 10 }));

        // Nothing was published and no eleventh entry appeared
        settle().await;
        assert_eq!(presence.viewers_of("alice").len(), MAX_VIEWERS_PER_ARRANGEMENT);
        let history = session.history(TOPIC_VIEWERS, 50).await.unwrap();
        assert!(!history
            .iter()
            .any(|m| m.event == EVENT_VIEWER_JOINED && m.payload["viewerId"] == "bob"));
    }

    #[tokio::test(start_paused = true)]
    async fn leave_when_not_joined_is_noop() {
        let transport = Arc::new(LocalChannel::new());
        let session = SessionChannel::new("ABCD", Arc::clone(&transport));
        let mut presence = ViewerPresence::new(Arc::clone(&transport));
        presence.initialize_for_session("ABCD", identity("bob"));

        presence.leave_viewer_session("alice").await.unwrap();
        assert!(session.history(TOPIC_VIEWERS, 50).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_stops_heartbeat_and_publishes() {
        let transport = Arc::new(LocalChannel::new());
        let session = SessionChannel::new("ABCD", Arc::clone(&transport));
        let mut presence = ViewerPresence::new(Arc::clone(&transport));
        presence.initialize_for_session("ABCD", identity("bob"));

        presence.join_viewer_session("alice").await.unwrap();
        presence.leave_viewer_session("alice").await.unwrap();

        let history = session.history(TOPIC_VIEWERS, 50).await.unwrap();
        assert_eq!(history.last().unwrap().event, EVENT_VIEWER_LEFT);

        // No heartbeats after leaving
        let before = history.len();
        tokio::time::sleep(HEARTBEAT_INTERVAL * 3).await;
        let after = session.history(TOPIC_VIEWERS, 50).await.unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_subscription_sees_joins_and_leaves() {
        let transport = Arc::new(LocalChannel::new());
        let session = SessionChannel::new("ABCD", Arc::clone(&transport));
        let mut presence = ViewerPresence::new(Arc::clone(&transport));
        presence.initialize_for_session("ABCD", identity("bob"));

        let snapshots: Arc<Mutex<Vec<Vec<ViewerEntry>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&snapshots);
        let _subscription =
            presence.subscribe_to_viewer_presence("alice", move |snapshot| sink.lock().push(snapshot));

        session
            .publish(TOPIC_VIEWERS, EVENT_VIEWER_JOINED, joined_payload("carol", "alice"))
            .await
            .unwrap();
        settle().await;
        session
            .publish(
                TOPIC_VIEWERS,
                EVENT_VIEWER_LEFT,
                serde_json::json!({"viewerId": "carol", "targetParticipantId": "alice"}),
            )
            .await
            .unwrap();
        settle().await;

        let seen = snapshots.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].len(), 1);
        assert_eq!(seen[0][0].participant_id, "carol");
        assert!(seen[1].is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_callback_stops() {
        let transport = Arc::new(LocalChannel::new());
        let session = SessionChannel::new("ABCD", Arc::clone(&transport));
        let mut presence = ViewerPresence::new(Arc::clone(&transport));
        presence.initialize_for_session("ABCD", identity("bob"));

        let snapshots: Arc<Mutex<Vec<Vec<ViewerEntry>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&snapshots);
        let subscription =
            presence.subscribe_to_viewer_presence("alice", move |snapshot| sink.lock().push(snapshot));
        subscription.unsubscribe();

        session
            .publish(TOPIC_VIEWERS, EVENT_VIEWER_JOINED, joined_payload("carol", "alice"))
            .await
            .unwrap();
        settle().await;
        assert!(snapshots.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_viewers_expire() {
        let transport = Arc::new(LocalChannel::new());
        let session = SessionChannel::new("ABCD", Arc::clone(&transport));
        let mut presence = ViewerPresence::new(Arc::clone(&transport));
        presence.initialize_for_session("ABCD", identity("bob"));

        session
            .publish(TOPIC_VIEWERS, EVENT_VIEWER_JOINED, joined_payload("carol", "alice"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(presence.viewers_of("alice").len(), 1);

        // Fresh viewers survive a sweep
        assert_eq!(presence.expire_stale(), 0);
        assert_eq!(presence.viewers_of("alice").len(), 1);

        // Past the liveness timeout with no activity, the viewer is dropped
        let later = Instant::now() + VIEWER_TIMEOUT + Duration::from_secs(1);
        assert_eq!(presence.expire_stale_at(later), 1);
        assert!(presence.viewers_of("alice").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_returns_to_uninitialized() {
        let transport = Arc::new(LocalChannel::new());
        let mut presence = ViewerPresence::new(Arc::clone(&transport));
        presence.initialize_for_session("ABCD", identity("bob"));
        presence.join_viewer_session("alice").await.ok();

        presence.cleanup();
        assert!(!presence.is_initialized());
        let err = presence.join_viewer_session("alice").await.unwrap_err();
        assert!(matches!(err, SyncError::NotInitialized));
    }
}
