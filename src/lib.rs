//! container-use: isolated, persistent, auditable development workspaces for
//! coding agents.
//!
//! Each environment binds a dedicated git branch, a worktree checkout outside
//! the source repo, and a live container whose `/workdir` mirrors the
//! worktree. Every file mutation and shell command becomes a git commit, with
//! command transcripts and configuration snapshots attached as git notes, so
//! any moment of an agent's work can be inspected or recovered with standard
//! git tooling.

pub mod config;
pub mod container;
pub mod environment;
pub mod git;
pub mod logging;
pub mod worktree;

pub use environment::{Environment, EnvironmentError, Service};
