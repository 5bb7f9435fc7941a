//! Card, pile, and step primitives.
//!
//! A card's identity is immutable; its pile tag and position hint change as
//! it moves through the sorting exercise.

use serde::{Deserialize, Serialize};

/// Size of the full starting deck.
pub const FULL_DECK_SIZE: usize = 40;

/// Named bucket a card can sit in. The legal set depends on the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PileTag {
    /// Face-down working deck
    Deck,
    /// Single-card holding area between deck and destination piles
    Staging,
    /// Step 1: "more important"
    More,
    /// Cards set aside in the current step
    Less,
    /// Step 2's exact-eight selection
    Top8,
    /// Step 3's exact-three selection
    Top3,
    /// Cast-offs carried forward from earlier steps; never a move target
    Discard,
}

impl PileTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deck => "deck",
            Self::Staging => "staging",
            Self::More => "more",
            Self::Less => "less",
            Self::Top8 => "top8",
            Self::Top3 => "top3",
            Self::Discard => "discard",
        }
    }
}

impl std::fmt::Display for PileTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered step progression. A step is not re-enterable once advanced past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStep {
    Step1,
    Step2,
    Step3,
}

impl GameStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Step1 => "step1",
            Self::Step2 => "step2",
            Self::Step3 => "step3",
        }
    }

    /// Next step in the progression, if any.
    pub fn next(&self) -> Option<GameStep> {
        match self {
            Self::Step1 => Some(Self::Step2),
            Self::Step2 => Some(Self::Step3),
            Self::Step3 => None,
        }
    }

    /// The pile whose contents feed the next step's deck.
    pub fn kept_pile(&self) -> PileTag {
        match self {
            Self::Step1 => PileTag::More,
            Self::Step2 => PileTag::Top8,
            Self::Step3 => PileTag::Top3,
        }
    }

    /// The pile for cards sorted out during this step.
    pub fn offload_pile(&self) -> PileTag {
        PileTag::Less
    }

    /// Legal move targets for this step.
    pub fn destination_piles(&self) -> [PileTag; 2] {
        [self.kept_pile(), self.offload_pile()]
    }

    /// Whether pile limits block moves (strict) or merely warn (lenient).
    pub fn strict_limits(&self) -> bool {
        !matches!(self, Self::Step1)
    }
}

impl std::fmt::Display for GameStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 2-D layout hint for a card within its pile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CardPosition {
    pub x: f64,
    pub y: f64,
}

impl CardPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A single card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    /// Stable identifier, unique within a deck
    pub id: String,

    /// Display name
    pub name: String,

    /// Longer description shown on the card face
    pub description: String,

    /// Current pile
    pub pile: PileTag,

    /// Layout hint, if the UI has placed this card
    pub position: Option<CardPosition>,
}

impl Card {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            pile: PileTag::Deck,
            position: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "pile": self.pile.as_str(),
            "position": self.position.map(|p| serde_json::json!({"x": p.x, "y": p.y})),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_progression() {
        assert_eq!(GameStep::Step1.next(), Some(GameStep::Step2));
        assert_eq!(GameStep::Step2.next(), Some(GameStep::Step3));
        assert_eq!(GameStep::Step3.next(), None);
        assert!(GameStep::Step1 < GameStep::Step3);
    }

    #[test]
    fn test_kept_piles() {
        assert_eq!(GameStep::Step1.kept_pile(), PileTag::More);
        assert_eq!(GameStep::Step2.kept_pile(), PileTag::Top8);
        assert_eq!(GameStep::Step3.kept_pile(), PileTag::Top3);
    }

    #[test]
    fn test_strictness() {
        assert!(!GameStep::Step1.strict_limits());
        assert!(GameStep::Step2.strict_limits());
        assert!(GameStep::Step3.strict_limits());
    }

    #[test]
    fn test_card_serde_round_trip() {
        let mut card = Card::new("c-1", "Honesty", "Being truthful");
        card.pile = PileTag::Top8;
        card.position = Some(CardPosition::new(10.0, 24.5));

        let json = serde_json::to_string(&card).unwrap();
        let back: Card = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "c-1");
        assert_eq!(back.pile, PileTag::Top8);
    }
}
