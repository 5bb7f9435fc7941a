//! Per-step working state for one participant.
//!
//! A container holds one step's deck, the single-card staging slot, the
//! step's destination piles, and the discard bucket carried forward from
//! earlier steps. Every mutation consults the constraint validator before
//! committing; rejected moves leave the card where it was and raise an
//! overflow warning that the caller clears on a deadline.
//!
//! Timing (auto-flip after a move, overflow auto-clear) is surfaced as data:
//! the container records deadlines and returns suggested delays, and the
//! event loop that owns it drives the clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use super::card::{Card, GameStep, PileTag};
use super::validator::{self, MoveContext, ValidationResult};

/// Delay before the next card auto-flips after a successful move.
pub const AUTO_FLIP_DELAY: Duration = Duration::from_millis(300);

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// How long a rejected move's overflow warning stays up.
pub fn overflow_clear_duration(step: GameStep) -> Duration {
    match step {
        GameStep::Step1 => Duration::from_secs(3),
        GameStep::Step2 => Duration::from_secs(4),
        GameStep::Step3 => Duration::from_secs(5),
    }
}

/// Raised when a move is rejected; auto-clears at `expires_at`.
#[derive(Debug, Clone)]
pub struct OverflowWarning {
    pub pile: PileTag,
    pub result: ValidationResult,
    pub raised_at: Instant,
    pub expires_at: Instant,
}

/// The kept/discarded projection handed from one step to the next.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    pub kept: Vec<Card>,
    pub discarded: Vec<Card>,
}

/// Outcome of a move operation.
#[derive(Debug, Clone)]
pub enum MoveOutcome {
    /// Card moved; flip the next deck card after the delay, if any.
    Moved { auto_flip_after: Option<Duration> },
    /// Validator refused; the card stayed put and an overflow warning is up.
    Rejected(ValidationResult),
    /// Nothing to do (same pile, missing card, empty staging).
    Unchanged,
}

impl MoveOutcome {
    pub fn is_moved(&self) -> bool {
        matches!(self, Self::Moved { .. })
    }
}

/// Container errors. Constraint violations are not errors; they come back
/// as `MoveOutcome::Rejected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    /// Steps advance forward one at a time and are never re-entered.
    InvalidStepTransition { from: GameStep, to: GameStep },
}

impl std::fmt::Display for ContainerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStepTransition { from, to } => {
                write!(f, "Cannot advance from {} to {}", from, to)
            }
        }
    }
}

impl std::error::Error for ContainerError {}

/// One participant's working state for one step.
#[derive(Debug)]
pub struct StepContainer {
    step: GameStep,
    instance_id: u64,
    deck: Vec<Card>,
    staging: Option<Card>,
    /// Destination piles for the current step
    piles: HashMap<PileTag, Vec<Card>>,
    /// Cast-offs carried from earlier steps
    discard: Vec<Card>,
    overflow: Option<OverflowWarning>,
}

impl StepContainer {
    pub fn new(step: GameStep) -> Self {
        Self {
            step,
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            deck: Vec::new(),
            staging: None,
            piles: step
                .destination_piles()
                .into_iter()
                .map(|pile| (pile, Vec::new()))
                .collect(),
            discard: Vec::new(),
            overflow: None,
        }
    }

    pub fn step(&self) -> GameStep {
        self.step
    }

    /// Stable identity for the lifetime of this container.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Cold start: load the full deck and shuffle it (Step 1).
    pub fn load_deck(&mut self, mut cards: Vec<Card>) {
        for card in &mut cards {
            card.pile = PileTag::Deck;
            card.position = None;
        }
        cards.shuffle(&mut rand::thread_rng());
        self.deck = cards;
        self.staging = None;
        self.overflow = None;
    }

    /// Build this step's deck from the prior step's kept pile and fold the
    /// prior step's cast-offs into the discard bucket.
    ///
    /// Post: `deck.len() == kept.len()`, discard grew by `discarded.len()`.
    pub fn initialize_from(&mut self, outputs: StepOutputs) {
        let StepOutputs { kept, mut discarded } = outputs;
        self.load_deck(kept);
        for card in &mut discarded {
            card.pile = PileTag::Discard;
            card.position = None;
        }
        self.discard.append(&mut discarded);
    }

    /// Advance this container to the next step, re-seeding it from its own
    /// outputs. Only the immediate next step is legal.
    ///
    /// `outputs()` already folds the carried discard into `discarded`, so the
    /// bucket is cleared here and rebuilt wholesale by `initialize_from`.
    pub fn advance_to(&mut self, step: GameStep) -> Result<(), ContainerError> {
        if self.step.next() != Some(step) {
            return Err(ContainerError::InvalidStepTransition { from: self.step, to: step });
        }
        let outputs = self.outputs();
        self.step = step;
        self.piles = step
            .destination_piles()
            .into_iter()
            .map(|pile| (pile, Vec::new()))
            .collect();
        self.discard.clear();
        self.initialize_from(outputs);
        Ok(())
    }

    /// Move the next deck card into staging. No-op when staging is occupied
    /// or the deck is exhausted.
    pub fn flip_next(&mut self) -> Option<&Card> {
        if self.staging.is_some() || self.deck.is_empty() {
            return None;
        }
        let mut card = self.deck.remove(0);
        card.pile = PileTag::Staging;
        self.staging = Some(card);
        self.staging.as_ref()
    }

    /// Move the staged card into a destination pile.
    pub fn move_staging_to_pile(&mut self, card_id: &str, target: PileTag) -> MoveOutcome {
        match &self.staging {
            Some(card) if card.id == card_id => {}
            _ => return MoveOutcome::Unchanged,
        }

        let prospective = self.pile_len(target) + 1;
        let verdict = self.validate(Some(PileTag::Staging), target, prospective);
        if !verdict.valid {
            self.raise_overflow(target, verdict.clone());
            return MoveOutcome::Rejected(verdict);
        }

        let mut card = self.staging.take().expect("staging checked above");
        card.pile = target;
        self.piles.entry(target).or_default().push(card);

        let auto_flip_after = if self.deck.is_empty() {
            None
        } else {
            Some(AUTO_FLIP_DELAY)
        };
        MoveOutcome::Moved { auto_flip_after }
    }

    /// Move a card between two destination piles. No-op when `from == to` or
    /// the card is not in `from`.
    pub fn move_between_piles(&mut self, card_id: &str, from: PileTag, to: PileTag) -> MoveOutcome {
        if from == to {
            return MoveOutcome::Unchanged;
        }
        let Some(index) = self
            .piles
            .get(&from)
            .and_then(|pile| pile.iter().position(|c| c.id == card_id))
        else {
            return MoveOutcome::Unchanged;
        };

        let prospective = self.pile_len(to) + 1;
        let verdict = self.validate(Some(from), to, prospective);
        if !verdict.valid {
            self.raise_overflow(to, verdict.clone());
            return MoveOutcome::Rejected(verdict);
        }

        let mut card = self
            .piles
            .get_mut(&from)
            .expect("pile checked above")
            .remove(index);
        card.pile = to;
        self.piles.entry(to).or_default().push(card);
        MoveOutcome::Moved { auto_flip_after: None }
    }

    /// Update a card's 2-D position hint within its current pile.
    pub fn set_card_position(&mut self, card_id: &str, x: f64, y: f64) -> bool {
        if let Some(card) = self
            .piles
            .values_mut()
            .flat_map(|pile| pile.iter_mut())
            .find(|c| c.id == card_id)
        {
            card.position = Some(super::card::CardPosition::new(x, y));
            return true;
        }
        false
    }

    /// Current overflow warning, if one is up.
    pub fn overflow_warning(&self) -> Option<&OverflowWarning> {
        self.overflow.as_ref()
    }

    /// Clear the overflow warning if its deadline has passed. Returns true
    /// if a warning was cleared.
    pub fn clear_expired_overflow(&mut self, now: Instant) -> bool {
        match &self.overflow {
            Some(warning) if now >= warning.expires_at => {
                self.overflow = None;
                true
            }
            _ => false,
        }
    }

    /// Whether every pile constraint of the step is simultaneously satisfied.
    pub fn can_progress(&self) -> ValidationResult {
        self.validate_progression()
    }

    /// Kept pile plus everything sorted out, for seeding the next step.
    pub fn outputs(&self) -> StepOutputs {
        let kept = self
            .piles
            .get(&self.step.kept_pile())
            .cloned()
            .unwrap_or_default();
        let mut discarded = self
            .piles
            .get(&self.step.offload_pile())
            .cloned()
            .unwrap_or_default();
        discarded.extend(self.discard.iter().cloned());
        StepOutputs { kept, discarded }
    }

    pub fn deck_len(&self) -> usize {
        self.deck.len()
    }

    pub fn staging(&self) -> Option<&Card> {
        self.staging.as_ref()
    }

    pub fn pile(&self, tag: PileTag) -> &[Card] {
        match tag {
            PileTag::Deck => &self.deck,
            PileTag::Discard => &self.discard,
            _ => self.piles.get(&tag).map(Vec::as_slice).unwrap_or(&[]),
        }
    }

    /// Snapshot of every pile count, including deck, staging, and discard.
    pub fn pile_counts(&self) -> HashMap<PileTag, usize> {
        let mut counts: HashMap<PileTag, usize> = self
            .piles
            .iter()
            .map(|(tag, pile)| (*tag, pile.len()))
            .collect();
        counts.insert(PileTag::Deck, self.deck.len());
        counts.insert(PileTag::Staging, usize::from(self.staging.is_some()));
        counts.insert(PileTag::Discard, self.discard.len());
        counts
    }

    /// Return to the empty initial state for this step.
    pub fn reset(&mut self) {
        self.deck.clear();
        self.staging = None;
        for pile in self.piles.values_mut() {
            pile.clear();
        }
        self.discard.clear();
        self.overflow = None;
    }

    /// Idempotent teardown. Safe on an already-empty container.
    pub fn cleanup(&mut self) {
        self.reset();
    }

    pub fn to_json(&self) -> serde_json::Value {
        let piles: serde_json::Map<String, serde_json::Value> = self
            .piles
            .iter()
            .map(|(tag, pile)| {
                (
                    tag.as_str().to_string(),
                    serde_json::Value::Array(pile.iter().map(|c| c.to_json()).collect()),
                )
            })
            .collect();
        serde_json::json!({
            "step": self.step.as_str(),
            "deck_count": self.deck.len(),
            "staging": self.staging.as_ref().map(|c| c.to_json()),
            "piles": piles,
            "discard_count": self.discard.len(),
        })
    }

    fn pile_len(&self, tag: PileTag) -> usize {
        match tag {
            PileTag::Staging => usize::from(self.staging.is_some()),
            _ => self.pile(tag).len(),
        }
    }

    fn validate(
        &self,
        source: Option<PileTag>,
        target: PileTag,
        prospective: usize,
    ) -> ValidationResult {
        validator::validate_move(&MoveContext {
            step: self.step,
            source_pile: source,
            target_pile: target,
            card_count: prospective,
            all_pile_counts: self.pile_counts(),
            is_progression: false,
        })
    }

    fn validate_progression(&self) -> ValidationResult {
        validator::validate_move(&MoveContext {
            step: self.step,
            source_pile: None,
            target_pile: self.step.kept_pile(),
            card_count: 0,
            all_pile_counts: self.pile_counts(),
            is_progression: true,
        })
    }

    fn raise_overflow(&mut self, pile: PileTag, result: ValidationResult) {
        let now = Instant::now();
        self.overflow = Some(OverflowWarning {
            pile,
            result,
            raised_at: now,
            expires_at: now + overflow_clear_duration(self.step),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_cards(n: usize) -> Vec<Card> {
        (0..n)
            .map(|i| Card::new(format!("c-{}", i), format!("Card {}", i), "desc"))
            .collect()
    }

    /// Flip and sort `n` cards into `target`, driving auto-flips by hand.
    fn sort_n(container: &mut StepContainer, n: usize, target: PileTag) {
        for _ in 0..n {
            let id = container.flip_next().expect("deck has cards").id.clone();
            assert!(container.move_staging_to_pile(&id, target).is_moved());
        }
    }

    #[test]
    fn test_load_deck_shuffles_all_cards_in() {
        let mut container = StepContainer::new(GameStep::Step1);
        container.load_deck(make_cards(40));
        assert_eq!(container.deck_len(), 40);
        assert!(container.staging().is_none());
    }

    #[test]
    fn test_flip_next_noop_when_staging_occupied() {
        let mut container = StepContainer::new(GameStep::Step1);
        container.load_deck(make_cards(3));

        assert!(container.flip_next().is_some());
        // Second flip is a no-op: staging still holds one card
        assert!(container.flip_next().is_none());
        assert_eq!(container.deck_len(), 2);
        assert!(container.staging().is_some());
    }

    #[test]
    fn test_flip_next_noop_on_empty_deck() {
        let mut container = StepContainer::new(GameStep::Step1);
        assert!(container.flip_next().is_none());
    }

    #[test]
    fn test_move_staging_commits_and_suggests_auto_flip() {
        let mut container = StepContainer::new(GameStep::Step1);
        container.load_deck(make_cards(2));

        let id = container.flip_next().unwrap().id.clone();
        match container.move_staging_to_pile(&id, PileTag::More) {
            MoveOutcome::Moved { auto_flip_after } => {
                assert_eq!(auto_flip_after, Some(AUTO_FLIP_DELAY))
            }
            other => panic!("expected Moved, got {:?}", other),
        }
        assert!(container.staging().is_none());
        assert_eq!(container.pile(PileTag::More).len(), 1);
        assert_eq!(container.pile(PileTag::More)[0].pile, PileTag::More);
    }

    #[test]
    fn test_no_auto_flip_on_empty_deck() {
        let mut container = StepContainer::new(GameStep::Step1);
        container.load_deck(make_cards(1));

        let id = container.flip_next().unwrap().id.clone();
        match container.move_staging_to_pile(&id, PileTag::Less) {
            MoveOutcome::Moved { auto_flip_after } => assert_eq!(auto_flip_after, None),
            other => panic!("expected Moved, got {:?}", other),
        }
    }

    #[test]
    fn test_ninth_card_bounces_and_stays_staged() {
        let mut container = StepContainer::new(GameStep::Step2);
        container.initialize_from(StepOutputs { kept: make_cards(9), discarded: vec![] });
        sort_n(&mut container, 8, PileTag::Top8);

        let id = container.flip_next().unwrap().id.clone();
        let outcome = container.move_staging_to_pile(&id, PileTag::Top8);
        assert!(matches!(outcome, MoveOutcome::Rejected(_)));

        // Not lost, not duplicated
        assert_eq!(container.pile(PileTag::Top8).len(), 8);
        assert_eq!(container.staging().unwrap().id, id);
        assert!(container.overflow_warning().is_some());
    }

    #[test]
    fn test_fourth_card_bounces_in_step3() {
        let mut container = StepContainer::new(GameStep::Step3);
        container.initialize_from(StepOutputs { kept: make_cards(4), discarded: vec![] });
        sort_n(&mut container, 3, PileTag::Top3);

        let id = container.flip_next().unwrap().id.clone();
        assert!(matches!(
            container.move_staging_to_pile(&id, PileTag::Top3),
            MoveOutcome::Rejected(_)
        ));
        assert_eq!(container.pile(PileTag::Top3).len(), 3);
        assert_eq!(container.staging().unwrap().id, id);
    }

    #[test]
    fn test_overflow_warning_clears_on_deadline() {
        let mut container = StepContainer::new(GameStep::Step2);
        container.initialize_from(StepOutputs { kept: make_cards(9), discarded: vec![] });
        sort_n(&mut container, 8, PileTag::Top8);
        let id = container.flip_next().unwrap().id.clone();
        container.move_staging_to_pile(&id, PileTag::Top8);

        let expires_at = container.overflow_warning().unwrap().expires_at;
        assert!(!container.clear_expired_overflow(expires_at - Duration::from_millis(1)));
        assert!(container.overflow_warning().is_some());
        assert!(container.clear_expired_overflow(expires_at));
        assert!(container.overflow_warning().is_none());
    }

    #[test]
    fn test_move_between_piles_same_pile_noop() {
        let mut container = StepContainer::new(GameStep::Step1);
        container.load_deck(make_cards(1));
        let id = container.flip_next().unwrap().id.clone();
        container.move_staging_to_pile(&id, PileTag::More);

        assert!(matches!(
            container.move_between_piles(&id, PileTag::More, PileTag::More),
            MoveOutcome::Unchanged
        ));
    }

    #[test]
    fn test_move_between_piles_revalidates() {
        let mut container = StepContainer::new(GameStep::Step2);
        container.initialize_from(StepOutputs { kept: make_cards(9), discarded: vec![] });
        sort_n(&mut container, 8, PileTag::Top8);
        // Ninth card goes to less
        let id = container.flip_next().unwrap().id.clone();
        assert!(container.move_staging_to_pile(&id, PileTag::Less).is_moved());

        // Pulling it into a full top8 bounces
        let outcome = container.move_between_piles(&id, PileTag::Less, PileTag::Top8);
        assert!(matches!(outcome, MoveOutcome::Rejected(_)));
        assert_eq!(container.pile(PileTag::Top8).len(), 8);
        assert_eq!(container.pile(PileTag::Less).len(), 1);

        // The reverse direction is fine
        let moved_id = container.pile(PileTag::Top8)[0].id.clone();
        assert!(container
            .move_between_piles(&moved_id, PileTag::Top8, PileTag::Less)
            .is_moved());
        assert_eq!(container.pile(PileTag::Top8).len(), 7);
    }

    #[test]
    fn test_initialize_from_preserves_composition() {
        let mut container = StepContainer::new(GameStep::Step2);
        container.initialize_from(StepOutputs {
            kept: make_cards(8),
            discarded: make_cards(8),
        });
        assert_eq!(container.deck_len(), 8);
        assert_eq!(container.pile(PileTag::Discard).len(), 8);
        assert!(container
            .pile(PileTag::Discard)
            .iter()
            .all(|c| c.pile == PileTag::Discard));
    }

    #[test]
    fn test_progression_gate_step2() {
        let mut container = StepContainer::new(GameStep::Step2);
        container.initialize_from(StepOutputs { kept: make_cards(8), discarded: vec![] });
        assert!(!container.can_progress().valid);

        sort_n(&mut container, 8, PileTag::Top8);
        let verdict = container.can_progress();
        assert!(verdict.valid, "{:?}", verdict);
    }

    #[test]
    fn test_progression_blocked_while_staging_occupied() {
        let mut container = StepContainer::new(GameStep::Step2);
        container.initialize_from(StepOutputs { kept: make_cards(9), discarded: vec![] });
        sort_n(&mut container, 8, PileTag::Top8);
        container.flip_next();

        let verdict = container.can_progress();
        assert!(!verdict.valid);
        assert!(verdict.message.unwrap().contains("staging"));
    }

    #[test]
    fn test_advance_to_next_step() {
        let mut container = StepContainer::new(GameStep::Step1);
        container.load_deck(make_cards(16));
        for i in 0..16 {
            let id = container.flip_next().unwrap().id.clone();
            let target = if i < 8 { PileTag::More } else { PileTag::Less };
            assert!(container.move_staging_to_pile(&id, target).is_moved());
        }

        container.advance_to(GameStep::Step2).unwrap();
        assert_eq!(container.step(), GameStep::Step2);
        assert_eq!(container.deck_len(), 8);
        assert_eq!(container.pile(PileTag::Discard).len(), 8);
    }

    #[test]
    fn test_carried_discard_not_duplicated_across_steps() {
        let mut container = StepContainer::new(GameStep::Step1);
        container.load_deck(make_cards(16));
        for i in 0..16 {
            let id = container.flip_next().unwrap().id.clone();
            let target = if i < 8 { PileTag::More } else { PileTag::Less };
            assert!(container.move_staging_to_pile(&id, target).is_moved());
        }

        container.advance_to(GameStep::Step2).unwrap();
        assert_eq!(container.pile(PileTag::Discard).len(), 8);

        sort_n(&mut container, 8, PileTag::Top8);
        container.advance_to(GameStep::Step3).unwrap();

        // Discard is the prior cast-offs exactly once; every card accounted for
        assert_eq!(container.deck_len(), 8);
        assert_eq!(container.pile(PileTag::Discard).len(), 8);
        assert_eq!(container.deck_len() + container.pile(PileTag::Discard).len(), 16);
    }

    #[test]
    fn test_advance_rejects_regression_and_skips() {
        let mut container = StepContainer::new(GameStep::Step2);
        assert_eq!(
            container.advance_to(GameStep::Step1),
            Err(ContainerError::InvalidStepTransition {
                from: GameStep::Step2,
                to: GameStep::Step1
            })
        );
        let mut step1 = StepContainer::new(GameStep::Step1);
        assert!(step1.advance_to(GameStep::Step3).is_err());
    }

    #[test]
    fn test_staging_cardinality_invariant() {
        let mut container = StepContainer::new(GameStep::Step1);
        container.load_deck(make_cards(5));

        for _ in 0..10 {
            container.flip_next();
            assert!(container.pile_counts()[&PileTag::Staging] <= 1);
            if let Some(card) = container.staging() {
                let id = card.id.clone();
                container.move_staging_to_pile(&id, PileTag::More);
            }
            assert!(container.pile_counts()[&PileTag::Staging] <= 1);
        }
    }

    #[test]
    fn test_cleanup_idempotent() {
        let mut container = StepContainer::new(GameStep::Step1);
        container.load_deck(make_cards(5));
        container.flip_next();

        container.cleanup();
        assert_eq!(container.deck_len(), 0);
        assert!(container.staging().is_none());
        // Safe to call again on an empty container
        container.cleanup();
        container.cleanup();
    }

    #[test]
    fn test_instance_ids_unique() {
        let a = StepContainer::new(GameStep::Step1);
        let b = StepContainer::new(GameStep::Step1);
        assert_ne!(a.instance_id(), b.instance_id());
    }
}
