//! Cardsort State Library
//!
//! This crate provides the session-isolated state and real-time sync engine
//! for the card sorting exercise: a shared session in which each participant
//! progressively reduces a 40-card deck to their top 8, then top 3, while
//! revealing and watching each other's arrangements live.
//!
//! # Overview
//!
//! - **Session Store Manager** - Keyed arena of per-participant step
//!   containers. Every container is reached through an explicit
//!   `(session_code, participant_id)` key; no shared singletons.
//!
//! - **Game-Step State Container** - One step's deck, single-card staging
//!   slot, and destination piles, with every mutation validated before it
//!   commits.
//!
//! - **Constraint Validator** - Pure rules engine for pile cardinality,
//!   strict or lenient per step, plus the progression gate.
//!
//! - **Channel Service** - Session-scoped pub/sub with bounded retained
//!   history, behind a trait so transports can be swapped (and faked in
//!   tests).
//!
//! - **Reveal / Arrangement Sync / Viewer Presence** - Best-effort mirrors
//!   of other participants' reveals, debounced arrangement updates, and
//!   capped viewer presence with heartbeats.
//!
//! # Design Principles
//!
//! 1. **Strict key isolation** - Two composite keys never share state; the
//!    only cross-participant path is the session channel.
//!
//! 2. **Validate before commit** - Containers consult the validator and
//!    reject without corrupting state; rejected cards stay where they were.
//!
//! 3. **Publish first, then trust it** - Local authoritative reveal state
//!    changes only after a successful publish.
//!
//! 4. **Eventual consistency** - Remote caches converge via debounce and
//!    last-write-wins on published timestamps; staleness is tolerated.
//!
//! # Example
//!
//! ```rust
//! use cardsort_state::state::{Card, GameStep, PileTag, SessionStoreManager};
//!
//! let mut manager = SessionStoreManager::new();
//! let container = manager.get_store("ABCD", "alice", GameStep::Step1).unwrap();
//!
//! let deck: Vec<Card> = (0..40)
//!     .map(|i| Card::new(format!("c-{i}"), format!("Card {i}"), ""))
//!     .collect();
//! container.load_deck(deck);
//!
//! let card_id = container.flip_next().unwrap().id.clone();
//! let outcome = container.move_staging_to_pile(&card_id, PileTag::More);
//! assert!(outcome.is_moved());
//! ```

pub mod channel;
pub mod state;
pub mod sync;

pub use channel::{Channel, ChannelError, ChannelMessage, LocalChannel, SessionChannel};
pub use state::{
    Card, CardPosition, GameStep, MoveOutcome, PileTag, SessionStoreManager, StepContainer,
    StoreError, StoreKey, ValidationResult,
};
pub use sync::{
    ArrangementEvent, ArrangementSync, ArrangementView, RevealManager, RevealState, RevealType,
    RevealedCard, SyncError, ViewerEntry, ViewerIdentity, ViewerPresence,
};
