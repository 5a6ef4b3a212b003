//! Stable exit codes for `screencrawl` commands.

use crate::core::types::SessionStatus;

/// Command succeeded; for `run`, the plan was fully covered.
pub const OK: i32 = 0;
/// Invalid config, plan generation failure or any other error.
pub const INVALID: i32 = 1;
/// The session ran out of budget or reachable flows.
pub const EXHAUSTED: i32 = 2;
/// The session failed (collaborator error or cancellation).
pub const FAILED: i32 = 3;

pub fn for_status(status: SessionStatus) -> i32 {
    match status {
        SessionStatus::Completed | SessionStatus::Running => OK,
        SessionStatus::Exhausted => EXHAUSTED,
        SessionStatus::Failed => FAILED,
    }
}
