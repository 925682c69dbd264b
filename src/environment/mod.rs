//! Environment core: the state machine owning a (branch, worktree, container)
//! triple, plus the process-wide registry.

pub mod error;
pub mod id;
mod instance;
mod service;
mod state;

pub use error::{EnvironmentError, Result};
pub use instance::{Environment, DEFAULT_BASE_IMAGE};
pub use service::Service;
pub use state::{format_log_note, EnvironmentState, HistoryEntry, STATE_SCHEMA_VERSION};
