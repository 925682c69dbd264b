//! Config directory layout.
//!
//! All persistent state lives under a single config root:
//!
//! ```text
//! <config_dir>/
//!   repos/<project>/              -- bare mirror of the user's repo
//!   worktrees/<project>/<ID>/     -- per-environment checkout
//! ```
//!
//! The root defaults to `~/.config/container-use` and can be overridden with
//! `CONTAINER_USE_CONFIG_DIR`. The override is read once, when a `Service` is
//! constructed; operations never consult the environment afterwards.

use std::path::{Path, PathBuf};

/// Environment variable overriding the config root (primarily for test isolation).
pub const CONFIG_DIR_ENV: &str = "CONTAINER_USE_CONFIG_DIR";

/// Default config root: `$HOME/.config/container-use`.
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("container-use")
}

/// Resolve the config root, honoring `CONTAINER_USE_CONFIG_DIR` when set.
pub fn config_dir_from_env() -> PathBuf {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default_config_dir(),
    }
}

/// Project namespace for a source repository: the basename of its path.
pub fn project_name(source: &Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string())
}
