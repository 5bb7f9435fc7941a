//! Pile constraint validation.
//!
//! A pure rules engine: given a step, a target pile, a candidate count, and
//! the full snapshot of pile counts, produce a verdict. Constraint
//! violations are expected, recoverable outcomes and are returned as
//! structured results, never as errors.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::card::{GameStep, PileTag};

/// Budget for a single validation call. Exceeding it is logged, not fatal.
const SLOW_VALIDATION_BUDGET: Duration = Duration::from_millis(5);

/// Per-pile cardinality rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct PileConstraint {
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub exact: Option<usize>,
    /// Evaluated only for progression checks.
    pub must_be_empty: bool,
    /// Counts at or above this (but within limits) annotate a warning.
    pub warning_threshold: Option<usize>,
}

impl PileConstraint {
    /// The hard upper bound, whichever of `exact`/`max` applies.
    pub fn limit(&self) -> Option<usize> {
        self.exact.or(self.max)
    }
}

/// How serious a verdict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What the presentation layer should do with a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuggestedAction {
    /// Return the card to where it came from
    Bounce,
    /// Grey out the drop zone
    Disable,
    /// Show a non-blocking warning
    Warn,
}

/// Verdict for one validation call.
///
/// Invariant: `valid == false` implies `severity != Info`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub severity: Severity,
    pub action: Option<SuggestedAction>,
    pub reason: Option<&'static str>,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            severity: Severity::Info,
            action: None,
            reason: None,
            message: None,
        }
    }

    /// Valid, but annotated with a non-blocking warning.
    pub fn ok_with_warning(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            severity: Severity::Warning,
            action: None,
            reason: None,
            message: Some(message.into()),
        }
    }

    pub fn rejected(
        severity: Severity,
        action: SuggestedAction,
        reason: &'static str,
        message: impl Into<String>,
    ) -> Self {
        debug_assert!(severity != Severity::Info);
        Self {
            valid: false,
            severity,
            action: Some(action),
            reason: Some(reason),
            message: Some(message.into()),
        }
    }
}

/// Visual classification of a pile for the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PileVisualState {
    Default,
    Valid,
    Warning,
    Error,
    Disabled,
}

/// Context for a single move or progression check.
#[derive(Debug, Clone)]
pub struct MoveContext {
    pub step: GameStep,
    pub source_pile: Option<PileTag>,
    pub target_pile: PileTag,
    /// Prospective count of the target pile (current + the moving card).
    pub card_count: usize,
    pub all_pile_counts: HashMap<PileTag, usize>,
    pub is_progression: bool,
}

/// A single failed progression requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressionViolation {
    ExactMismatch { pile: PileTag, expected: usize, actual: usize },
    Underflow { pile: PileTag, minimum: usize, actual: usize },
    NotEmpty { pile: PileTag, actual: usize },
}

impl ProgressionViolation {
    pub fn message(&self) -> String {
        match self {
            Self::ExactMismatch { pile, expected, actual } => {
                format!("{} must contain exactly {} cards (has {})", pile, expected, actual)
            }
            Self::Underflow { pile, minimum, actual } => {
                format!("{} needs at least {} cards (has {})", pile, minimum, actual)
            }
            Self::NotEmpty { pile, actual } => {
                format!("{} must be empty ({} remaining)", pile, actual)
            }
        }
    }
}

/// Constraint record for a (step, pile) pair, if the pile exists in the step.
pub fn constraint_for(step: GameStep, pile: PileTag) -> Option<PileConstraint> {
    match pile {
        PileTag::Deck => Some(PileConstraint {
            must_be_empty: true,
            ..Default::default()
        }),
        PileTag::Staging => Some(PileConstraint {
            max: Some(1),
            must_be_empty: true,
            ..Default::default()
        }),
        PileTag::More if step == GameStep::Step1 => Some(PileConstraint {
            max: Some(20),
            warning_threshold: Some(16),
            ..Default::default()
        }),
        PileTag::Less => Some(PileConstraint::default()),
        PileTag::Top8 if step == GameStep::Step2 => Some(PileConstraint {
            exact: Some(8),
            warning_threshold: Some(6),
            ..Default::default()
        }),
        PileTag::Top3 if step == GameStep::Step3 => Some(PileConstraint {
            exact: Some(3),
            warning_threshold: Some(2),
            ..Default::default()
        }),
        _ => None,
    }
}

/// Whether a pile is a legal drop target in a step. The deck and the carried
/// discard bucket are never drop targets.
pub fn is_move_target(step: GameStep, pile: PileTag) -> bool {
    pile == PileTag::Staging || step.destination_piles().contains(&pile)
}

/// Piles that participate in a progression check, in reporting order.
fn progression_piles(step: GameStep) -> [PileTag; 4] {
    [step.kept_pile(), PileTag::Deck, PileTag::Staging, step.offload_pile()]
}

/// Validate a single move or a progression attempt.
pub fn validate_move(ctx: &MoveContext) -> ValidationResult {
    let started = Instant::now();
    let result = validate_move_inner(ctx);
    let elapsed = started.elapsed();
    if elapsed > SLOW_VALIDATION_BUDGET {
        tracing::warn!(
            target: "cardsort.validator",
            step = ctx.step.as_str(),
            pile = ctx.target_pile.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "validation exceeded budget"
        );
    }
    result
}

fn validate_move_inner(ctx: &MoveContext) -> ValidationResult {
    if ctx.is_progression {
        return validate_progression(ctx.step, &ctx.all_pile_counts);
    }

    if !is_move_target(ctx.step, ctx.target_pile) {
        return ValidationResult::rejected(
            Severity::Error,
            SuggestedAction::Bounce,
            "invalid_target",
            "Invalid target pile",
        );
    }

    if ctx.target_pile == PileTag::Staging && ctx.card_count > 1 {
        return ValidationResult::rejected(
            Severity::Warning,
            SuggestedAction::Bounce,
            "staging_occupied",
            "Staging already holds a card",
        );
    }

    let constraint = match constraint_for(ctx.step, ctx.target_pile) {
        Some(c) => c,
        None => {
            return ValidationResult::rejected(
                Severity::Error,
                SuggestedAction::Bounce,
                "invalid_target",
                "Invalid target pile",
            )
        }
    };

    if let Some(max) = constraint.max {
        if ctx.card_count > max {
            if ctx.step.strict_limits() {
                return ValidationResult::rejected(
                    Severity::Error,
                    SuggestedAction::Bounce,
                    "over_limit",
                    format!("{} holds at most {} cards", ctx.target_pile, max),
                );
            }
            return ValidationResult::ok_with_warning(format!(
                "{} is over its suggested limit of {}",
                ctx.target_pile, max
            ));
        }
    }

    if let Some(exact) = constraint.exact {
        if ctx.card_count > exact {
            return ValidationResult::rejected(
                Severity::Error,
                SuggestedAction::Bounce,
                "over_limit",
                format!("{} holds exactly {} cards", ctx.target_pile, exact),
            );
        }
    }

    if let (Some(threshold), Some(limit)) = (constraint.warning_threshold, constraint.limit()) {
        if ctx.card_count >= threshold && ctx.card_count < limit {
            return ValidationResult::ok_with_warning(format!(
                "{} is nearly full ({}/{})",
                ctx.target_pile, ctx.card_count, limit
            ));
        }
    }

    ValidationResult::ok()
}

/// Evaluate every constraint of the step against the full snapshot.
fn validate_progression(step: GameStep, counts: &HashMap<PileTag, usize>) -> ValidationResult {
    let violations = collect_violations(step, counts);
    match violations.first() {
        Some(first) => ValidationResult::rejected(
            Severity::Error,
            SuggestedAction::Disable,
            progression_reason(first),
            first.message(),
        ),
        None => ValidationResult::ok(),
    }
}

fn progression_reason(violation: &ProgressionViolation) -> &'static str {
    match violation {
        ProgressionViolation::ExactMismatch { .. } => "exact_mismatch",
        ProgressionViolation::Underflow { .. } => "underflow",
        ProgressionViolation::NotEmpty { .. } => "not_empty",
    }
}

fn collect_violations(step: GameStep, counts: &HashMap<PileTag, usize>) -> Vec<ProgressionViolation> {
    let mut violations = Vec::new();
    for pile in progression_piles(step) {
        let Some(constraint) = constraint_for(step, pile) else {
            continue;
        };
        let count = counts.get(&pile).copied().unwrap_or(0);
        if let Some(exact) = constraint.exact {
            if count != exact {
                violations.push(ProgressionViolation::ExactMismatch {
                    pile,
                    expected: exact,
                    actual: count,
                });
                continue;
            }
        }
        if let Some(min) = constraint.min {
            if count < min {
                violations.push(ProgressionViolation::Underflow {
                    pile,
                    minimum: min,
                    actual: count,
                });
                continue;
            }
        }
        if constraint.must_be_empty && count > 0 {
            violations.push(ProgressionViolation::NotEmpty { pile, actual: count });
        }
    }
    violations
}

/// Visual classification of a pile at a given count.
pub fn pile_state(step: GameStep, pile: PileTag, count: usize) -> PileVisualState {
    let Some(constraint) = constraint_for(step, pile) else {
        return PileVisualState::Default;
    };

    if is_drop_zone_disabled(step, pile, count) {
        return PileVisualState::Disabled;
    }
    if let Some(limit) = constraint.limit() {
        if count > limit {
            return PileVisualState::Error;
        }
        if let Some(exact) = constraint.exact {
            if count == exact {
                return PileVisualState::Valid;
            }
        }
        if let Some(threshold) = constraint.warning_threshold {
            if count >= threshold {
                return PileVisualState::Warning;
            }
        }
    }
    PileVisualState::Default
}

/// "count" or "count/limit" for the pile's counter badge.
pub fn counter_display(step: GameStep, pile: PileTag, count: usize) -> String {
    match constraint_for(step, pile).and_then(|c| c.limit()) {
        Some(limit) => format!("{}/{}", count, limit),
        None => count.to_string(),
    }
}

/// A drop zone is disabled only under strict enforcement at/over the limit.
pub fn is_drop_zone_disabled(step: GameStep, pile: PileTag, count: usize) -> bool {
    if !step.strict_limits() {
        return false;
    }
    match constraint_for(step, pile).and_then(|c| c.limit()) {
        Some(limit) => count >= limit,
        None => false,
    }
}

/// Classify every pile of one snapshot.
pub fn batch_validate_piles(
    step: GameStep,
    counts: &HashMap<PileTag, usize>,
) -> HashMap<PileTag, PileVisualState> {
    counts
        .iter()
        .map(|(pile, count)| (*pile, pile_state(step, *pile, *count)))
        .collect()
}
