//! Real-time synchronization between participants.
//!
//! Everything in this module is a best-effort mirror of remote truth, driven
//! by events on the session channel. It is never authoritative for anyone but
//! the local participant; cross-participant effects happen exclusively through
//! published events.
//!
//! - `reveal` - publishing and mirroring revealed selections
//! - `arrangement` - per-target subscriptions with debounced updates
//! - `presence` - who is watching whom, with caps and heartbeats

pub mod arrangement;
pub mod presence;
pub mod reveal;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelError;
use crate::state::card::CardPosition;

pub use arrangement::{ArrangementEvent, ArrangementSync, SubscriptionHandle};
pub use presence::{ViewerEntry, ViewerIdentity, ViewerPresence, MAX_VIEWERS_PER_ARRANGEMENT};
pub use reveal::RevealManager;

/// Topic carrying reveal/unreveal/update events.
pub const TOPIC_REVEALS: &str = "reveals";
/// Topic carrying viewer join/leave/heartbeat events.
pub const TOPIC_VIEWERS: &str = "viewers";

pub const EVENT_ARRANGEMENT_REVEALED: &str = "arrangement-revealed";
pub const EVENT_ARRANGEMENT_UPDATED: &str = "arrangement-updated";
pub const EVENT_ARRANGEMENT_HIDDEN: &str = "arrangement-hidden";
pub const EVENT_VIEWER_JOINED: &str = "viewer-joined";
pub const EVENT_VIEWER_LEFT: &str = "viewer-left";
pub const EVENT_VIEWER_ACTIVITY: &str = "viewer-activity";

/// Which selection a reveal concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealType {
    Top8,
    Top3,
}

impl RevealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Top8 => "top8",
            Self::Top3 => "top3",
        }
    }
}

impl std::fmt::Display for RevealType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One card inside a revealed arrangement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealedCard {
    pub card_id: String,
    pub name: String,
    pub position: CardPosition,
}

/// A participant's reveal, as tracked locally (own authoritative copy) or
/// mirrored from events (remote, best effort).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealState {
    pub participant_id: String,
    pub participant_name: String,
    pub session_code: String,
    pub reveal_type: RevealType,
    pub is_revealed: bool,
    pub card_positions: Vec<RevealedCard>,
    pub last_updated: DateTime<Utc>,
    pub viewer_count: usize,
}

/// Read-only projection of a remote participant's reveal for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrangementView {
    pub participant_id: String,
    pub participant_name: String,
    pub reveal_type: RevealType,
    pub card_positions: Vec<RevealedCard>,
    pub last_updated: DateTime<Utc>,
}

/// Wire payload for `arrangement-revealed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrangementRevealedPayload {
    pub participant_id: String,
    pub participant_name: String,
    pub reveal_type: RevealType,
    pub cards: Vec<RevealedCard>,
    pub is_revealed: bool,
    pub last_updated: DateTime<Utc>,
}

/// Wire payload for `arrangement-updated` (incremental delta).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrangementUpdatedPayload {
    pub participant_id: String,
    pub cards: Vec<RevealedCard>,
    pub last_updated: DateTime<Utc>,
}

/// Wire payload for `arrangement-hidden`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrangementHiddenPayload {
    pub participant_id: String,
}

/// Wire payload for `viewer-joined`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerJoinedPayload {
    pub viewer_id: String,
    pub viewer_name: String,
    pub viewer_emoji: String,
    pub viewer_color: String,
    pub target_participant_id: String,
    pub joined_at: DateTime<Utc>,
}

/// Wire payload for `viewer-left`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerLeftPayload {
    pub viewer_id: String,
    pub target_participant_id: String,
}

/// Wire payload for `viewer-activity` (heartbeat).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerActivityPayload {
    pub viewer_id: String,
    pub target_participant_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_active: bool,
}

/// Sync-layer errors. Constraint-style outcomes never appear here; these are
/// precondition, transport, and capacity failures.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("manager already cleaned up")]
    CleanedUp,

    #[error("not currently revealed for {0}")]
    NotRevealed(RevealType),

    #[error("target participant {0} is not revealed")]
    TargetNotRevealed(String),

    #[error("viewer presence not initialized for a session")]
    NotInitialized,

    #[error("maximum viewers reached ({max})")]
    ViewerCapReached { max: usize },

    #[error(transparent)]
    Transport(#[from] ChannelError),
}

pub type SyncResult<T> = Result<T, SyncError>;
