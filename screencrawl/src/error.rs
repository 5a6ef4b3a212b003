//! Error taxonomy at the crate boundary.
//!
//! Collaborator failures surface as [`CrawlError`]; IO helpers below this
//! boundary use `anyhow` and are folded in as [`CrawlError::Storage`].

use thiserror::Error;

use crate::io::device::DeviceError;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("plan generation failed: {0}")]
    PlanGeneration(String),
    #[error("device transport failed: {0}")]
    ActionTransport(String),
    #[error("action target not found: {0}")]
    ActionTarget(String),
    #[error("inconsistent evaluation: {}", .0.join("; "))]
    EvaluationInconsistency(Vec<String>),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("storage: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<DeviceError> for CrawlError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Transport(message) => CrawlError::ActionTransport(message),
            DeviceError::Target(message) => CrawlError::ActionTarget(message),
        }
    }
}

pub type CrawlResult<T> = Result<T, CrawlError>;
