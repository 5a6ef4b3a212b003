//! Iteration and time budgets for one session.

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Limits a session runs under. Reaching any of them ends the session
/// `exhausted`, never `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_iterations: u32,
    pub session_timeout_secs: u64,
    pub step_timeout_secs: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            session_timeout_secs: 1800,
            step_timeout_secs: 120,
        }
    }
}

impl Budget {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Reason text when the session has run out of iterations or time.
    pub fn exhausted(&self, iterations: u32, elapsed: Duration) -> Option<String> {
        if iterations >= self.max_iterations {
            return Some(format!(
                "iteration budget reached ({} of {})",
                iterations, self.max_iterations
            ));
        }
        if elapsed >= self.session_timeout() {
            return Some(format!(
                "session timeout reached after {}s",
                elapsed.as_secs()
            ));
        }
        None
    }

    /// Deadline for one explorer step: the step timeout, capped by the
    /// session deadline.
    pub fn step_deadline(&self, now: Instant, session_deadline: Instant) -> Instant {
        (now + self.step_timeout()).min(session_deadline)
    }
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Result<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(anyhow!("step deadline expired"));
    }
    Ok(remaining)
}
