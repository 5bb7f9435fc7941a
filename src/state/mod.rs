//! Per-participant sorting state.
//!
//! This module provides the core state types and managers:
//!
//! - `card` - Card, pile, and step primitives
//! - `validator` - Pure pile-constraint rules engine
//! - `container` - One step's working set (deck, staging, piles)
//! - `store` - Keyed arena of containers, one per (session, participant)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    SessionStoreManager                        │
//! │                                                               │
//! │  (session_code, participant_id) ──▶ StepContainer             │
//! │  (session_code, participant_id) ──▶ StepContainer             │
//! │                                         │                     │
//! │                                         │ every mutation      │
//! │                                         ▼                     │
//! │                                  validator::validate_move     │
//! │                                  (pure, stateless)            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! No container is ever shared between two composite keys, and nothing in
//! this module is a process-wide singleton: all access goes through the
//! manager with an explicit key. Mutations are serialized by the caller;
//! containers with different keys share no state and need no coordination.

pub mod card;
pub mod container;
pub mod store;
pub mod validator;

// Re-export commonly used types
pub use card::{Card, CardPosition, GameStep, PileTag, FULL_DECK_SIZE};
pub use container::{
    ContainerError, MoveOutcome, OverflowWarning, StepContainer, StepOutputs, AUTO_FLIP_DELAY,
};
pub use store::{SessionStoreManager, StoreError, StoreKey, DEFAULT_IDLE_TIMEOUT};
pub use validator::{
    batch_validate_piles, counter_display, is_drop_zone_disabled, pile_state, validate_move,
    MoveContext, PileConstraint, PileVisualState, Severity, SuggestedAction, ValidationResult,
};
