//! Stall detection over consecutive explorer outcomes.

use crate::core::types::StepOutcome;

/// Counts consecutive non-advancing outcomes on the same flow.
///
/// `record` returns true exactly when the count reaches the threshold; the
/// tracker then resets so a blocked flow is reported once.
#[derive(Debug, Clone)]
pub struct StallTracker {
    threshold: u32,
    flow: Option<String>,
    count: u32,
}

impl StallTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            flow: None,
            count: 0,
        }
    }

    pub fn record(&mut self, flow_id: Option<&str>, outcome: StepOutcome) -> bool {
        let Some(flow_id) = flow_id else {
            self.reset();
            return false;
        };
        if !outcome.is_stalled() {
            self.reset();
            return false;
        }

        if self.flow.as_deref() == Some(flow_id) {
            self.count += 1;
        } else {
            self.flow = Some(flow_id.to_string());
            self.count = 1;
        }

        if self.count >= self.threshold {
            self.reset();
            return true;
        }
        false
    }

    /// Consecutive stalls recorded against the current flow.
    pub fn count(&self) -> u32 {
        self.count
    }

    fn reset(&mut self) {
        self.flow = None;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_at_exactly_the_threshold() {
        let mut tracker = StallTracker::new(3);
        assert!(!tracker.record(Some("a"), StepOutcome::ActionFailed));
        assert!(!tracker.record(Some("a"), StepOutcome::NoProgress));
        assert!(tracker.record(Some("a"), StepOutcome::ActionFailed));
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn advance_resets_the_count() {
        let mut tracker = StallTracker::new(2);
        assert!(!tracker.record(Some("a"), StepOutcome::NoProgress));
        assert!(!tracker.record(Some("a"), StepOutcome::Advanced));
        assert!(!tracker.record(Some("a"), StepOutcome::NoProgress));
        assert!(tracker.record(Some("a"), StepOutcome::NoProgress));
    }

    #[test]
    fn switching_flows_restarts_the_count() {
        let mut tracker = StallTracker::new(2);
        assert!(!tracker.record(Some("a"), StepOutcome::NoProgress));
        assert!(!tracker.record(Some("b"), StepOutcome::NoProgress));
        assert_eq!(tracker.count(), 1);
        assert!(tracker.record(Some("b"), StepOutcome::ActionFailed));
    }

    #[test]
    fn steps_without_a_flow_reset() {
        let mut tracker = StallTracker::new(2);
        assert!(!tracker.record(Some("a"), StepOutcome::NoProgress));
        assert!(!tracker.record(None, StepOutcome::NoProgress));
        assert!(!tracker.record(Some("a"), StepOutcome::NoProgress));
    }
}
