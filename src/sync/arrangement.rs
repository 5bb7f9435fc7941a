//! Per-target arrangement subscriptions.
//!
//! Reveals are discrete, user-intentional actions and apply immediately.
//! Arrangement deltas arrive in bursts while a participant drags cards
//! around, so they are debounced per participant: within one window only the
//! last update is applied, and the published `lastUpdated` timestamp decides
//! conflicts (last write wins). A hidden event is an explicit "no longer
//! available" signal, distinct from "never revealed".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::channel::{Channel, ChannelMessage, SessionChannel};

use super::{
    ArrangementHiddenPayload, ArrangementRevealedPayload, ArrangementUpdatedPayload,
    ArrangementView, SyncResult, EVENT_ARRANGEMENT_HIDDEN, EVENT_ARRANGEMENT_REVEALED,
    EVENT_ARRANGEMENT_UPDATED, TOPIC_REVEALS,
};

/// Debounce window for arrangement deltas.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// History slice consulted for cold-start reconstruction.
const HISTORY_FETCH_LIMIT: usize = 50;

/// What a subscriber is told about its target.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrangementEvent {
    /// A fresh view of the target's arrangement
    Updated(ArrangementView),
    /// The target unrevealed; the arrangement is gone, not loading
    Hidden,
}

type Callback = Arc<dyn Fn(ArrangementEvent) + Send + Sync>;
type Cache = Arc<Mutex<HashMap<String, ArrangementView>>>;

#[derive(Default)]
struct DebounceState {
    pending: Option<ArrangementUpdatedPayload>,
    timer: Option<AbortHandle>,
}

struct SubShared {
    target: String,
    callback: Callback,
    debounce: Mutex<DebounceState>,
    /// Gate checked before every callback; cleared synchronously on
    /// unsubscribe so no further invocation happens after it returns.
    active: AtomicBool,
}

impl SubShared {
    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        let mut debounce = self.debounce.lock();
        debounce.pending = None;
        if let Some(timer) = debounce.timer.take() {
            timer.abort();
        }
    }

    fn emit(&self, event: ArrangementEvent) {
        if self.active.load(Ordering::SeqCst) {
            (self.callback)(event);
        }
    }
}

/// Handle returned by `subscribe_to_participant`. Unsubscribing (or dropping)
/// synchronously stops callbacks and clears any pending debounce.
pub struct SubscriptionHandle {
    shared: Arc<SubShared>,
    listener: AbortHandle,
}

impl SubscriptionHandle {
    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.shared.deactivate();
        self.listener.abort();
    }
}

/// Tracks the latest known arrangement per remote participant.
pub struct ArrangementSync<C: Channel> {
    channel: SessionChannel<C>,
    cache: Cache,
    /// Every live subscription, for cleanup
    registry: Mutex<Vec<(Arc<SubShared>, AbortHandle)>>,
}

impl<C: Channel + 'static> ArrangementSync<C> {
    pub fn new(channel: SessionChannel<C>) -> Self {
        Self {
            channel,
            cache: Arc::new(Mutex::new(HashMap::new())),
            registry: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to one participant's arrangement. The callback fires
    /// immediately with the current arrangement if one is known (cache or
    /// history), then on every live change.
    pub async fn subscribe_to_participant(
        &self,
        participant_id: &str,
        on_update: impl Fn(ArrangementEvent) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        let shared = Arc::new(SubShared {
            target: participant_id.to_string(),
            callback: Arc::new(on_update),
            debounce: Mutex::new(DebounceState::default()),
            active: AtomicBool::new(true),
        });

        if let Some(view) = self.get_current_arrangement(participant_id).await? {
            shared.emit(ArrangementEvent::Updated(view));
        }

        let rx = self.channel.subscribe(TOPIC_REVEALS);
        let listener = spawn_listener(rx, Arc::clone(&shared), Arc::clone(&self.cache));
        let handle = SubscriptionHandle {
            shared: Arc::clone(&shared),
            listener: listener.abort_handle(),
        };
        self.registry.lock().push((shared, listener.abort_handle()));
        Ok(handle)
    }

    /// Latest known arrangement for a target: cache first, then a replay of
    /// the channel's retained history. "Never revealed" is `None`, not an
    /// error, and a failed history read degrades to `None` as well.
    pub async fn get_current_arrangement(
        &self,
        participant_id: &str,
    ) -> SyncResult<Option<ArrangementView>> {
        if let Some(view) = self.cache.lock().get(participant_id).cloned() {
            return Ok(Some(view));
        }

        let history = match self.channel.history(TOPIC_REVEALS, HISTORY_FETCH_LIMIT).await {
            Ok(history) => history,
            Err(err) => {
                tracing::warn!(
                    target: "cardsort.sync",
                    participant = participant_id,
                    error = %err,
                    "history fetch failed; treating arrangement as absent"
                );
                return Ok(None);
            }
        };

        let view = rebuild_from_history(participant_id, &history);
        if let Some(view) = &view {
            self.cache
                .lock()
                .insert(participant_id.to_string(), view.clone());
        }
        Ok(view)
    }

    /// Stop every subscription and drop all per-participant state.
    pub fn cleanup(&self) {
        for (shared, listener) in self.registry.lock().drain(..) {
            shared.deactivate();
            listener.abort();
        }
        self.cache.lock().clear();
    }
}

impl<C: Channel> Drop for ArrangementSync<C> {
    fn drop(&mut self) {
        for (shared, listener) in self.registry.lock().drain(..) {
            shared.deactivate();
            listener.abort();
        }
    }
}

/// Newest-first scan: the first event concerning the participant decides.
/// A hidden event means unrevealed, a revealed event reconstructs the view.
fn rebuild_from_history(
    participant_id: &str,
    history: &[ChannelMessage],
) -> Option<ArrangementView> {
    for msg in history.iter().rev() {
        match msg.event.as_str() {
            EVENT_ARRANGEMENT_HIDDEN => {
                if let Ok(payload) =
                    serde_json::from_value::<ArrangementHiddenPayload>(msg.payload.clone())
                {
                    if payload.participant_id == participant_id {
                        return None;
                    }
                }
            }
            EVENT_ARRANGEMENT_REVEALED => {
                if let Ok(payload) =
                    serde_json::from_value::<ArrangementRevealedPayload>(msg.payload.clone())
                {
                    if payload.participant_id == participant_id {
                        if !payload.is_revealed {
                            return None;
                        }
                        return Some(ArrangementView {
                            participant_id: payload.participant_id,
                            participant_name: payload.participant_name,
                            reveal_type: payload.reveal_type,
                            card_positions: payload.cards,
                            last_updated: payload.last_updated,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn spawn_listener(
    mut rx: tokio::sync::broadcast::Receiver<ChannelMessage>,
    shared: Arc<SubShared>,
    cache: Cache,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            handle_message(&shared, &cache, msg);
        }
    })
}

fn handle_message(shared: &Arc<SubShared>, cache: &Cache, msg: ChannelMessage) {
    match msg.event.as_str() {
        EVENT_ARRANGEMENT_REVEALED => {
            let Ok(payload) =
                serde_json::from_value::<ArrangementRevealedPayload>(msg.payload)
            else {
                return;
            };
            if payload.participant_id != shared.target || !payload.is_revealed {
                return;
            }
            let view = ArrangementView {
                participant_id: payload.participant_id,
                participant_name: payload.participant_name,
                reveal_type: payload.reveal_type,
                card_positions: payload.cards,
                last_updated: payload.last_updated,
            };
            cache
                .lock()
                .insert(shared.target.clone(), view.clone());
            // A reveal is discrete and intentional; no debounce
            shared.emit(ArrangementEvent::Updated(view));
        }
        EVENT_ARRANGEMENT_UPDATED => {
            let Ok(payload) =
                serde_json::from_value::<ArrangementUpdatedPayload>(msg.payload)
            else {
                return;
            };
            if payload.participant_id != shared.target {
                return;
            }
            schedule_debounced(shared, cache, payload);
        }
        EVENT_ARRANGEMENT_HIDDEN => {
            let Ok(payload) =
                serde_json::from_value::<ArrangementHiddenPayload>(msg.payload)
            else {
                return;
            };
            if payload.participant_id != shared.target {
                return;
            }
            {
                let mut debounce = shared.debounce.lock();
                debounce.pending = None;
                if let Some(timer) = debounce.timer.take() {
                    timer.abort();
                }
            }
            cache.lock().remove(&shared.target);
            shared.emit(ArrangementEvent::Hidden);
        }
        _ => {}
    }
}

/// Record the delta and arm the window timer if it is not already running.
/// Later deltas inside the window just overwrite the pending slot.
fn schedule_debounced(
    shared: &Arc<SubShared>,
    cache: &Cache,
    payload: ArrangementUpdatedPayload,
) {
    let mut debounce = shared.debounce.lock();
    debounce.pending = Some(payload);
    if debounce.timer.is_some() {
        return;
    }

    let shared = Arc::clone(shared);
    let cache = Arc::clone(cache);
    let timer = tokio::spawn(async move {
        tokio::time::sleep(DEBOUNCE_WINDOW).await;

        let pending = {
            let mut debounce = shared.debounce.lock();
            debounce.timer = None;
            debounce.pending.take()
        };
        let Some(payload) = pending else { return };

        let view = {
            let mut cache = cache.lock();
            match cache.get_mut(&shared.target) {
                // Last write wins on the published timestamp
                Some(view) if payload.last_updated >= view.last_updated => {
                    view.card_positions = payload.cards;
                    view.last_updated = payload.last_updated;
                    Some(view.clone())
                }
                _ => None,
            }
        };
        if let Some(view) = view {
            shared.emit(ArrangementEvent::Updated(view));
        }
    });
    debounce.timer = Some(timer.abort_handle());
}
