//! Flow matching: does a piece of evidence show the screen a flow asks for?
//!
//! The evaluator depends only on the [`Classifier`] trait, so the matching
//! strategy (rule-based here, model-backed in `agents::classifier`) can be
//! swapped without touching the control loop.

use std::collections::HashSet;
use std::time::Instant;

use crate::core::plan::Flow;
use crate::core::types::Evidence;

/// Verdict for one (evidence, flow) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub completed: bool,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

impl Classification {
    pub fn no_match() -> Self {
        Self {
            completed: false,
            confidence: 0.0,
        }
    }
}

/// Decide whether `evidence` satisfies `flow`.
///
/// Implementations must be deterministic for a given (evidence, flow) pair:
/// the evaluator's idempotence and monotonicity depend on it. Work past
/// `deadline` is not started; the pair then counts as no match.
pub trait Classifier {
    fn classify(&self, evidence: &Evidence, flow: &Flow, deadline: Instant) -> Classification;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn classify(&self, evidence: &Evidence, flow: &Flow, deadline: Instant) -> Classification {
        (**self).classify(evidence, flow, deadline)
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "into", "onto", "then", "than", "that", "this", "screen",
    "screens", "view", "page", "state", "states", "show", "shows", "showing", "open", "opens",
    "user", "users", "app", "tap", "taps", "navigate", "capture", "via", "its", "are", "all",
];

/// Rule-based classifier over extracted screen labels.
///
/// - If the flow lists `expect` labels, all of them must be present
///   (case-insensitive) for a match with confidence 1.0; partial presence
///   yields the matched fraction.
/// - Otherwise confidence is the fraction of description keywords found
///   among the label tokens, and any hit is a candidate match. The
///   evaluator's `min_confidence` decides whether it counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl Classifier for KeywordClassifier {
    fn classify(&self, evidence: &Evidence, flow: &Flow, _deadline: Instant) -> Classification {
        if !flow.expect.is_empty() {
            let present: HashSet<String> =
                evidence.labels.iter().map(|l| l.to_lowercase()).collect();
            let hits = flow
                .expect
                .iter()
                .filter(|label| present.contains(&label.to_lowercase()))
                .count();
            let confidence = hits as f64 / flow.expect.len() as f64;
            return Classification {
                completed: hits == flow.expect.len(),
                confidence,
            };
        }

        let wanted = keywords(&flow.description);
        if wanted.is_empty() {
            return Classification::no_match();
        }
        let available: HashSet<String> = evidence
            .labels
            .iter()
            .flat_map(|label| keywords(label.as_str()))
            .collect();
        let hits = wanted.iter().filter(|word| available.contains(*word)).count();
        let confidence = hits as f64 / wanted.len() as f64;
        Classification {
            completed: hits > 0,
            confidence,
        }
    }
}

/// Lowercase alphanumeric tokens of at least three chars, minus stopwords.
pub fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}
