use thiserror::Error;

use crate::container::ContainerError;
use crate::git::GitError;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation canceled: {0}")]
    Canceled(String),

    #[error("State note decode failed: {0}")]
    StateDecode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EnvironmentError>;
