//! Process-wide environment registry.
//!
//! A `Service` owns the config dir, the container engine, and the map of live
//! environments. Everything an operation needs hangs off this handle; no
//! global state, no env-var reads after construction. Environments are
//! reconstructed from the mirror's branches and their state notes after a
//! process restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::config;
use crate::container::ContainerEngine;
use crate::git::{Git, NOTES_STATE_REF};
use crate::worktree::WorktreeManager;

use super::error::{EnvironmentError, Result};
use super::id;
use super::instance::{Environment, DEFAULT_BASE_IMAGE};
use super::state::{EnvironmentState, STATE_SCHEMA_VERSION};

/// Attempts at rolling a fresh ID before giving up with `Conflict`.
const ID_ATTEMPTS: usize = 5;

pub struct Service {
    config_dir: PathBuf,
    engine: ContainerEngine,
    manager: WorktreeManager,
    registry: RwLock<HashMap<String, Arc<Mutex<Environment>>>>,
}

impl Service {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self::with_engine(config_dir, ContainerEngine::default())
    }

    pub fn with_engine(config_dir: impl Into<PathBuf>, engine: ContainerEngine) -> Self {
        let config_dir = config_dir.into();
        let manager = WorktreeManager::new(&config_dir);
        Self {
            config_dir,
            engine,
            manager,
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Construct from `CONTAINER_USE_CONFIG_DIR` / the default config root.
    /// The environment is consulted exactly once, here.
    pub fn from_env() -> Self {
        Self::new(config::config_dir_from_env())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Create a new environment: branch + worktree + container, first
    /// snapshot committed, state note written, instance registered.
    pub fn create(
        &self,
        explanation: &str,
        source: &Path,
        name: &str,
    ) -> Result<Arc<Mutex<Environment>>> {
        if id::slugify(name).is_empty() {
            return Err(EnvironmentError::InvalidArgument(
                "environment name must not be empty".to_string(),
            ));
        }
        let source = source.canonicalize()?;

        // Suffix collisions are near-impossible; re-roll instead of failing.
        let mut chosen = None;
        for _ in 0..ID_ATTEMPTS {
            let candidate = id::generate_id(name);
            if !self.manager.branch_exists(&source, &candidate) {
                chosen = Some(candidate);
                break;
            }
        }
        let env_id = chosen.ok_or_else(|| {
            EnvironmentError::Conflict(format!("could not allocate a unique ID for '{name}'"))
        })?;

        let worktree = self.manager.create_worktree(&source, &env_id)?;
        let mut environment = Environment::new(
            env_id.clone(),
            name.to_string(),
            explanation.to_string(),
            source.clone(),
            worktree,
            self.manager.clone(),
            self.engine.clone(),
        );
        if let Err(e) = environment.initialize() {
            // Don't leave a half-built triple behind; the mirror branch is
            // harmless and keeps whatever was recorded.
            if let Err(cleanup) = self.manager.remove_worktree(&source, &env_id) {
                tracing::warn!(id = %env_id, error = %cleanup, "worktree cleanup failed");
            }
            if let Err(cleanup) = self.manager.delete_branch_from_source(&source, &env_id) {
                tracing::warn!(id = %env_id, error = %cleanup, "branch cleanup failed");
            }
            return Err(e);
        }

        tracing::info!(id = %env_id, "created environment");
        let handle = Arc::new(Mutex::new(environment));
        self.write_registry().insert(env_id, handle.clone());
        Ok(handle)
    }

    /// Live instance for an ID, if any.
    pub fn get(&self, env_id: &str) -> Option<Arc<Mutex<Environment>>> {
        self.read_registry().get(env_id).cloned()
    }

    /// Enumerate environments for a source repo by reading the mirror's
    /// branches. Branches with a state note decode to their saved
    /// configuration; branches without one synthesize defaults. Instances
    /// whose worktree is still on disk are (re-)registered as live.
    pub fn list(&self, source: &Path) -> Result<Vec<EnvironmentState>> {
        let source = source.canonicalize()?;
        let mirror_git = Git::new(self.manager.mirror_path(&source));

        let mut states = Vec::new();
        for branch in self.manager.list_branches(&source)? {
            if !id::is_environment_id(&branch) {
                continue;
            }

            let state = match mirror_git.notes_show(NOTES_STATE_REF, &branch) {
                Ok(note) => EnvironmentState::decode_latest_for(&note, &branch)
                    .unwrap_or_else(|| minimal_state(&branch)),
                Err(_) => minimal_state(&branch),
            };

            let worktree = self.manager.worktree_path(&source, &branch);
            if worktree.exists() && self.get(&branch).is_none() {
                let environment = Environment::from_state(
                    state.clone(),
                    source.clone(),
                    worktree,
                    self.manager.clone(),
                    self.engine.clone(),
                );
                self.write_registry()
                    .insert(branch.clone(), Arc::new(Mutex::new(environment)));
            }

            states.push(state);
        }
        Ok(states)
    }

    /// Tear down an environment and deregister it.
    pub fn delete(&self, env_id: &str) -> Result<()> {
        let handle = self
            .get(env_id)
            .ok_or_else(|| EnvironmentError::NotFound(env_id.to_string()))?;

        handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .delete()?;

        self.write_registry().remove(env_id);
        tracing::info!(id = %env_id, "deleted environment");
        Ok(())
    }

    /// Drop all in-memory instances, keeping git state untouched. Test hook
    /// for simulating a process restart.
    pub fn clear_registry(&self) {
        self.write_registry().clear();
    }

    fn read_registry(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<Environment>>>> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_registry(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<Environment>>>> {
        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Defaults for a branch whose tip carries no state note.
fn minimal_state(branch: &str) -> EnvironmentState {
    let name = branch.split('/').next().unwrap_or(branch).to_string();
    EnvironmentState {
        schema_version: STATE_SCHEMA_VERSION,
        id: branch.to_string(),
        name,
        explanation: String::new(),
        base_image: DEFAULT_BASE_IMAGE.to_string(),
        setup_commands: Vec::new(),
        env: Vec::new(),
        secrets: Vec::new(),
        instructions: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_state_defaults() {
        let state = minimal_state("myapp/happy-otter");
        assert_eq!(state.id, "myapp/happy-otter");
        assert_eq!(state.name, "myapp");
        assert_eq!(state.base_image, DEFAULT_BASE_IMAGE);
        assert!(state.setup_commands.is_empty());
        assert!(state.env.is_empty());
    }

    #[test]
    fn test_get_unknown_id_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let service = Service::new(dir.path());
        assert!(service.get("ghost/quiet-lynx").is_none());
    }

    #[test]
    fn test_create_rejects_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let service = Service::new(dir.path());
        let err = service.create("Test", dir.path(), "  !! ").unwrap_err();
        assert!(matches!(err, EnvironmentError::InvalidArgument(_)));
    }

    #[test]
    fn test_list_for_untracked_source_is_empty() {
        let config = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let service = Service::new(config.path());
        let states = service.list(source.path()).unwrap();
        assert!(states.is_empty());
    }
}
