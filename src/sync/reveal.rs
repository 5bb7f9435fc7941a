//! Reveal publishing and mirroring.
//!
//! One `RevealManager` per participant, bound to the session's `reveals`
//! topic. The manager's own reveal states are authoritative and change only
//! after a publish succeeds; everything it knows about other participants is
//! a best-effort mirror built from inbound events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelError, ChannelMessage, SessionChannel};

use super::presence::ViewerIdentity;
use super::{
    ArrangementHiddenPayload, ArrangementRevealedPayload, ArrangementUpdatedPayload, RevealState,
    RevealType, RevealedCard, SyncError, SyncResult, ViewerJoinedPayload, ViewerLeftPayload,
    EVENT_ARRANGEMENT_HIDDEN, EVENT_ARRANGEMENT_REVEALED, EVENT_ARRANGEMENT_UPDATED,
    EVENT_VIEWER_JOINED, EVENT_VIEWER_LEFT, TOPIC_REVEALS, TOPIC_VIEWERS,
};

type StateMap = Arc<Mutex<HashMap<RevealType, RevealState>>>;
type RemoteMap = Arc<Mutex<HashMap<String, RevealState>>>;

/// Per-participant reveal state, local and mirrored.
pub struct RevealManager<C: Channel> {
    channel: SessionChannel<C>,
    identity: ViewerIdentity,
    /// Own authoritative reveal states, keyed by type
    own: StateMap,
    /// Mirror of every other participant's reveal, keyed by participant id
    remote: RemoteMap,
    listeners: Vec<JoinHandle<()>>,
    cleaned_up: bool,
}

impl<C: Channel + 'static> RevealManager<C> {
    pub fn new(channel: SessionChannel<C>, identity: ViewerIdentity) -> Self {
        let own: StateMap = Arc::new(Mutex::new(HashMap::new()));
        let remote: RemoteMap = Arc::new(Mutex::new(HashMap::new()));

        let reveals_rx = channel.subscribe(TOPIC_REVEALS);
        let viewers_rx = channel.subscribe(TOPIC_VIEWERS);
        let listeners = vec![
            spawn_reveals_listener(
                reveals_rx,
                identity.participant_id.clone(),
                channel.session_code().to_string(),
                Arc::clone(&remote),
            ),
            spawn_viewers_listener(viewers_rx, Arc::clone(&own), Arc::clone(&remote)),
        ];

        Self {
            channel,
            identity,
            own,
            remote,
            listeners,
            cleaned_up: false,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.identity.participant_id
    }

    /// Publish a reveal. Local state becomes revealed only if the publish
    /// succeeds; on failure nothing changes and the error propagates.
    pub async fn reveal_selection(
        &mut self,
        reveal_type: RevealType,
        cards: Vec<RevealedCard>,
    ) -> SyncResult<()> {
        self.ensure_active()?;
        let now = Utc::now();
        let payload = ArrangementRevealedPayload {
            participant_id: self.identity.participant_id.clone(),
            participant_name: self.identity.name.clone(),
            reveal_type,
            cards: cards.clone(),
            is_revealed: true,
            last_updated: now,
        };
        self.publish(TOPIC_REVEALS, EVENT_ARRANGEMENT_REVEALED, &payload)
            .await?;

        let viewer_count = self
            .own
            .lock()
            .get(&reveal_type)
            .map(|s| s.viewer_count)
            .unwrap_or(0);
        self.own.lock().insert(
            reveal_type,
            RevealState {
                participant_id: self.identity.participant_id.clone(),
                participant_name: self.identity.name.clone(),
                session_code: self.channel.session_code().to_string(),
                reveal_type,
                is_revealed: true,
                card_positions: cards,
                last_updated: now,
                viewer_count,
            },
        );
        Ok(())
    }

    /// Publish an unreveal, clearing local state only on publish success.
    pub async fn unreveal_selection(&mut self, reveal_type: RevealType) -> SyncResult<()> {
        self.ensure_active()?;
        if !self.is_revealed(reveal_type) {
            return Err(SyncError::NotRevealed(reveal_type));
        }
        let payload = ArrangementHiddenPayload {
            participant_id: self.identity.participant_id.clone(),
        };
        self.publish(TOPIC_REVEALS, EVENT_ARRANGEMENT_HIDDEN, &payload)
            .await?;
        self.own.lock().remove(&reveal_type);
        Ok(())
    }

    /// Publish an incremental arrangement update. Only permitted while
    /// currently revealed for that exact type.
    pub async fn update_arrangement(
        &mut self,
        reveal_type: RevealType,
        cards: Vec<RevealedCard>,
    ) -> SyncResult<()> {
        self.ensure_active()?;
        if !self.is_revealed(reveal_type) {
            return Err(SyncError::NotRevealed(reveal_type));
        }
        let now = Utc::now();
        let payload = ArrangementUpdatedPayload {
            participant_id: self.identity.participant_id.clone(),
            cards: cards.clone(),
            last_updated: now,
        };
        self.publish(TOPIC_REVEALS, EVENT_ARRANGEMENT_UPDATED, &payload)
            .await?;

        if let Some(state) = self.own.lock().get_mut(&reveal_type) {
            state.card_positions = cards;
            state.last_updated = now;
        }
        Ok(())
    }

    /// Announce this participant as a viewer of a revealed target.
    pub async fn join_viewer(&mut self, target_participant_id: &str) -> SyncResult<()> {
        self.ensure_active()?;
        let revealed = self
            .remote
            .lock()
            .get(target_participant_id)
            .map(|s| s.is_revealed)
            .unwrap_or(false);
        if !revealed {
            return Err(SyncError::TargetNotRevealed(target_participant_id.to_string()));
        }
        let payload = ViewerJoinedPayload {
            viewer_id: self.identity.participant_id.clone(),
            viewer_name: self.identity.name.clone(),
            viewer_emoji: self.identity.emoji.clone(),
            viewer_color: self.identity.color.clone(),
            target_participant_id: target_participant_id.to_string(),
            joined_at: Utc::now(),
        };
        self.publish(TOPIC_VIEWERS, EVENT_VIEWER_JOINED, &payload).await
    }

    pub async fn leave_viewer(&mut self, target_participant_id: &str) -> SyncResult<()> {
        self.ensure_active()?;
        let payload = ViewerLeftPayload {
            viewer_id: self.identity.participant_id.clone(),
            target_participant_id: target_participant_id.to_string(),
        };
        self.publish(TOPIC_VIEWERS, EVENT_VIEWER_LEFT, &payload).await
    }

    pub fn is_revealed(&self, reveal_type: RevealType) -> bool {
        self.own
            .lock()
            .get(&reveal_type)
            .map(|s| s.is_revealed)
            .unwrap_or(false)
    }

    /// This participant's own reveal state for one type.
    pub fn get_own_reveal(&self, reveal_type: RevealType) -> Option<RevealState> {
        self.own.lock().get(&reveal_type).cloned()
    }

    /// Reveal state for any participant: own authoritative copy for self
    /// (the most recently updated reveal when both types are up), the
    /// mirrored copy for anyone else.
    pub fn get_reveal_state(&self, participant_id: &str) -> Option<RevealState> {
        if participant_id == self.identity.participant_id {
            let own = self.own.lock();
            own.values()
                .filter(|s| s.is_revealed)
                .max_by_key(|s| s.last_updated)
                .cloned()
        } else {
            self.remote.lock().get(participant_id).cloned()
        }
    }

    /// Snapshot of every mirrored remote reveal.
    pub fn revealed_participants(&self) -> Vec<RevealState> {
        self.remote.lock().values().cloned().collect()
    }

    /// Unsubscribe everything. Idempotent; all further mutating calls fail
    /// with `SyncError::CleanedUp`.
    pub fn cleanup(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        self.own.lock().clear();
        self.remote.lock().clear();
        self.cleaned_up = true;
    }

    fn ensure_active(&self) -> SyncResult<()> {
        if self.cleaned_up {
            return Err(SyncError::CleanedUp);
        }
        Ok(())
    }

    async fn publish<T: serde::Serialize>(
        &self,
        topic: &str,
        event: &str,
        payload: &T,
    ) -> SyncResult<()> {
        let value = serde_json::to_value(payload)
            .map_err(|err| ChannelError::Transport(err.to_string()))?;
        self.channel.publish(topic, event, value).await?;
        Ok(())
    }
}

impl<C: Channel> Drop for RevealManager<C> {
    fn drop(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
    }
}

fn spawn_reveals_listener(
    mut rx: tokio::sync::broadcast::Receiver<ChannelMessage>,
    self_id: String,
    session_code: String,
    remote: RemoteMap,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            apply_reveal_event(&self_id, &session_code, &remote, &msg);
        }
    })
}

fn apply_reveal_event(self_id: &str, session_code: &str, remote: &RemoteMap, msg: &ChannelMessage) {
    match msg.event.as_str() {
        EVENT_ARRANGEMENT_REVEALED => {
            let Some(payload) = decode::<ArrangementRevealedPayload>(msg) else {
                return;
            };
            if payload.participant_id == self_id {
                return;
            }
            let mut remote = remote.lock();
            let viewer_count = remote
                .get(&payload.participant_id)
                .map(|s| s.viewer_count)
                .unwrap_or(0);
            remote.insert(
                payload.participant_id.clone(),
                RevealState {
                    participant_id: payload.participant_id,
                    participant_name: payload.participant_name,
                    session_code: session_code.to_string(),
                    reveal_type: payload.reveal_type,
                    is_revealed: payload.is_revealed,
                    card_positions: payload.cards,
                    last_updated: payload.last_updated,
                    viewer_count,
                },
            );
        }
        EVENT_ARRANGEMENT_UPDATED => {
            let Some(payload) = decode::<ArrangementUpdatedPayload>(msg) else {
                return;
            };
            if payload.participant_id == self_id {
                return;
            }
            let mut remote = remote.lock();
            if let Some(state) = remote.get_mut(&payload.participant_id) {
                // Last write wins on the published timestamp
                if payload.last_updated >= state.last_updated {
                    state.card_positions = payload.cards;
                    state.last_updated = payload.last_updated;
                }
            }
        }
        EVENT_ARRANGEMENT_HIDDEN => {
            let Some(payload) = decode::<ArrangementHiddenPayload>(msg) else {
                return;
            };
            remote.lock().remove(&payload.participant_id);
        }
        _ => {}
    }
}

fn spawn_viewers_listener(
    mut rx: tokio::sync::broadcast::Receiver<ChannelMessage>,
    own: StateMap,
    remote: RemoteMap,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            apply_viewer_event(&own, &remote, &msg);
        }
    })
}

fn apply_viewer_event(own: &StateMap, remote: &RemoteMap, msg: &ChannelMessage) {
    let (target, delta): (String, i64) = match msg.event.as_str() {
        EVENT_VIEWER_JOINED => match decode::<ViewerJoinedPayload>(msg) {
            Some(p) => (p.target_participant_id, 1),
            None => return,
        },
        EVENT_VIEWER_LEFT => match decode::<ViewerLeftPayload>(msg) {
            Some(p) => (p.target_participant_id, -1),
            None => return,
        },
        _ => return,
    };

    if let Some(state) = remote.lock().get_mut(&target) {
        state.viewer_count = adjust(state.viewer_count, delta);
    }
    let mut own = own.lock();
    for state in own.values_mut() {
        if state.participant_id == target && state.is_revealed {
            state.viewer_count = adjust(state.viewer_count, delta);
        }
    }
}

fn adjust(count: usize, delta: i64) -> usize {
    if delta >= 0 {
        count.saturating_add(delta as usize)
    } else {
        count.saturating_sub(delta.unsigned_abs() as usize)
    }
}

fn decode<T: serde::de::DeserializeOwned>(msg: &ChannelMessage) -> Option<T> {
    match serde_json::from_value(msg.payload.clone()) {
        Ok(payload) => Some(payload),
        Err(err) => {
            tracing::warn!(
                target: "cardsort.sync",
                event = %msg.event,
                error = %err,
                "failed to decode channel payload"
            );
            None
        }
    }
}
