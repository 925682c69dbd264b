//! Environment instance: the (branch, worktree, container) triple and its
//! mutating operations.
//!
//! Every operation keeps the triple in lock-step: the change is applied to
//! the container first, `/workdir` is the canonical filesystem, and whatever
//! lands in the worktree is selectively staged and committed. State changes
//! additionally write a note on the state ref; command commits write a
//! transcript note on the log ref.

use std::path::{Path, PathBuf};

use crate::container::{
    BuildSpec, ContainerEngine, ContainerEngineInterface, ContainerError, HostDirSnapshot,
    SandboxContainer, WORKDIR,
};
use crate::git::{Git, NOTES_LOG_REF, NOTES_STATE_REF};
use crate::worktree::WorktreeManager;

use super::error::{EnvironmentError, Result};
use super::state::{format_log_note, EnvironmentState, HistoryEntry, STATE_SCHEMA_VERSION};

/// Base image for environments that never configured one.
pub const DEFAULT_BASE_IMAGE: &str = "ubuntu:latest";

#[derive(Debug)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub explanation: String,
    pub source: PathBuf,
    pub worktree: PathBuf,
    pub base_image: String,
    pub setup_commands: Vec<String>,
    pub env: Vec<String>,
    /// Opaque secret references; resolved values exist only during builds.
    pub secrets: Vec<String>,
    pub instructions: String,
    pub history: Vec<HistoryEntry>,

    engine: ContainerEngine,
    container: SandboxContainer,
    /// Tag of the most recently built image; empty until the first build.
    image_tag: String,
    git: Git,
    manager: WorktreeManager,
}

impl Environment {
    pub(crate) fn new(
        id: String,
        name: String,
        explanation: String,
        source: PathBuf,
        worktree: PathBuf,
        manager: WorktreeManager,
        engine: ContainerEngine,
    ) -> Self {
        let container = SandboxContainer::new(&id, engine.clone());
        let git = Git::new(&worktree);
        Self {
            id,
            name,
            explanation,
            source,
            worktree,
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            setup_commands: Vec::new(),
            env: Vec::new(),
            secrets: Vec::new(),
            instructions: String::new(),
            history: Vec::new(),
            engine,
            container,
            image_tag: String::new(),
            git,
            manager,
        }
    }

    /// Rehydrate from a decoded state note after a process restart.
    pub(crate) fn from_state(
        state: EnvironmentState,
        source: PathBuf,
        worktree: PathBuf,
        manager: WorktreeManager,
        engine: ContainerEngine,
    ) -> Self {
        let mut env = Self::new(
            state.id,
            state.name,
            state.explanation,
            source,
            worktree,
            manager,
            engine,
        );
        env.base_image = if state.base_image.is_empty() {
            DEFAULT_BASE_IMAGE.to_string()
        } else {
            state.base_image
        };
        env.setup_commands = state.setup_commands;
        env.env = state.env;
        env.secrets = state.secrets;
        env.instructions = state.instructions;
        env
    }

    /// First build + initial snapshot. Called once by the service right after
    /// the worktree exists.
    pub(crate) fn initialize(&mut self) -> Result<()> {
        self.rebuild_container()?;
        self.git.add_non_binary()?;
        let commit = self.git.commit_if_dirty("Initial snapshot", &self.explanation)?;
        self.write_state_note(commit.as_deref())?;
        if commit.is_some() {
            self.manager.sync_branch_to_source(&self.source, &self.id)?;
        }
        Ok(())
    }

    /// Configuration subset serialized into state notes.
    pub fn state(&self) -> EnvironmentState {
        EnvironmentState {
            schema_version: STATE_SCHEMA_VERSION,
            id: self.id.clone(),
            name: self.name.clone(),
            explanation: self.explanation.clone(),
            base_image: self.base_image.clone(),
            setup_commands: self.setup_commands.clone(),
            env: self.env.clone(),
            secrets: self.secrets.clone(),
            instructions: self.instructions.clone(),
        }
    }

    /// Run a shell command in the container, export `/workdir` back to the
    /// worktree, and commit whatever changed. Returns combined stdout+stderr
    /// even when the command exits non-zero; only engine failures error.
    pub fn run(
        &mut self,
        explanation: &str,
        command: &str,
        shell: &str,
        use_entrypoint: bool,
    ) -> Result<String> {
        self.ensure_container()?;
        let result = self.container.exec(command, shell, use_entrypoint)?;
        if result.exit_code != 0 {
            tracing::debug!(exit_code = result.exit_code, command = %command, "command exited non-zero");
        }

        self.container.export_workdir(&self.worktree)?;
        self.git.add_non_binary()?;

        let name = format!("Run {command}");
        if let Some(commit) = self.git.commit_if_dirty(&name, explanation)? {
            self.git.notes_append(
                NOTES_LOG_REF,
                &commit,
                &format_log_note(command, explanation, &result.output),
            )?;
            self.manager.sync_branch_to_source(&self.source, &self.id)?;
        }

        self.history
            .push(HistoryEntry::new(name, explanation).with_command(command, result.output.clone()));
        Ok(result.output)
    }

    /// Create or overwrite a file. The write goes into the container first;
    /// worktree paths are mirrored to the host and committed.
    pub fn file_write(&mut self, explanation: &str, path: &str, contents: &str) -> Result<()> {
        let rel = workdir_relative(path)?;
        let container_path = match &rel {
            Some(rel) => format!("{WORKDIR}/{rel}"),
            None => path.to_string(),
        };

        self.ensure_container()?;
        self.container
            .write_file(&container_path, contents.as_bytes())?;

        let name = match rel {
            Some(rel) => {
                let host = self.worktree.join(&rel);
                if let Some(parent) = host.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&host, contents)?;

                self.git.add_non_binary()?;
                let name = format!("Write {rel}");
                if self.git.commit_if_dirty(&name, explanation)?.is_some() {
                    self.manager.sync_branch_to_source(&self.source, &self.id)?;
                }
                name
            }
            // Paths outside /workdir only exist in the container.
            None => format!("Write {path}"),
        };

        self.history.push(HistoryEntry::new(name, explanation));
        Ok(())
    }

    /// Read a file from the container. Offset and limit are in bytes;
    /// `text_mode` enforces UTF-8 and strips trailing carriage returns.
    pub fn file_read(
        &mut self,
        path: &str,
        text_mode: bool,
        offset: usize,
        limit: usize,
    ) -> Result<String> {
        if path.is_empty() {
            return Err(EnvironmentError::InvalidArgument(
                "path must not be empty".to_string(),
            ));
        }
        workdir_relative(path)?;

        self.ensure_container()?;
        let container_path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{WORKDIR}/{path}")
        };

        let bytes = match self.container.read_file(&container_path) {
            Err(ContainerError::FileNotFound(p)) => return Err(EnvironmentError::NotFound(p)),
            other => other?,
        };

        let start = offset.min(bytes.len());
        let end = if limit > 0 {
            start.saturating_add(limit).min(bytes.len())
        } else {
            bytes.len()
        };
        let window = &bytes[start..end];

        if text_mode {
            let text = std::str::from_utf8(window)
                .map_err(|_| ContainerError::NotUtf8(path.to_string()))?;
            Ok(strip_trailing_cr(text))
        } else {
            Ok(String::from_utf8_lossy(window).into_owned())
        }
    }

    /// Replace the environment's variable list and re-create the container so
    /// the new values are exported. The state change is recorded in a note.
    pub fn set_env(&mut self, explanation: &str, env: Vec<String>) -> Result<()> {
        for pair in &env {
            if !pair.contains('=') {
                return Err(EnvironmentError::InvalidArgument(format!(
                    "environment entries must be KEY=VALUE, got '{pair}'"
                )));
            }
        }
        self.env = env;

        if self.image_tag.is_empty() {
            self.rebuild_container()?;
        } else {
            self.replace_container()?;
        }

        self.git.add_non_binary()?;
        let commit = self.git.commit_if_dirty("Set env", explanation)?;
        self.write_state_note(commit.as_deref())?;
        if commit.is_some() {
            self.manager.sync_branch_to_source(&self.source, &self.id)?;
        }

        self.history.push(HistoryEntry::new("Set env", explanation));
        Ok(())
    }

    /// Reconfigure the environment. `None` keeps the current value; an empty
    /// list explicitly clears. Any configuration argument triggers an image
    /// rebuild from the worktree as it is right now, and the replacement
    /// container gets the full current env list exported.
    pub fn update(
        &mut self,
        name: Option<&str>,
        explanation: &str,
        base_image: Option<&str>,
        setup_commands: Option<Vec<String>>,
        env: Option<Vec<String>>,
        secrets: Option<Vec<String>>,
    ) -> Result<()> {
        let rebuild =
            base_image.is_some() || setup_commands.is_some() || env.is_some() || secrets.is_some();
        let rename = name.is_some();

        if let Some(name) = name {
            if !name.is_empty() {
                self.name = name.to_string();
            }
        }
        if let Some(image) = base_image {
            if !image.is_empty() {
                self.base_image = image.to_string();
            }
        }
        if let Some(commands) = setup_commands {
            self.setup_commands = commands;
        }
        if let Some(env) = env {
            for pair in &env {
                if !pair.contains('=') {
                    return Err(EnvironmentError::InvalidArgument(format!(
                        "environment entries must be KEY=VALUE, got '{pair}'"
                    )));
                }
            }
            self.env = env;
        }
        if let Some(secrets) = secrets {
            self.secrets = secrets;
        }

        if !rebuild && !rename {
            // Nothing to change; record the intent without touching the branch.
            self.history
                .push(HistoryEntry::new("Update environment", explanation));
            return Ok(());
        }

        if rebuild {
            self.rebuild_container()?;
        }

        self.git.add_non_binary()?;
        let commit = self.git.commit_if_dirty("Update environment", explanation)?;
        self.write_state_note(commit.as_deref())?;
        if commit.is_some() {
            self.manager.sync_branch_to_source(&self.source, &self.id)?;
        }

        self.history
            .push(HistoryEntry::new("Update environment", explanation));
        Ok(())
    }

    /// Copy a host directory into the container. The directory is snapshotted
    /// at call time, so repeated uploads always ship current content.
    pub fn upload(&mut self, explanation: &str, source_uri: &str, dest: &str) -> Result<()> {
        let Some(dir) = source_uri.strip_prefix("file://") else {
            return Err(EnvironmentError::InvalidArgument(format!(
                "unsupported source URI: {source_uri}"
            )));
        };
        let dir = Path::new(dir);
        if !dir.is_dir() {
            return Err(EnvironmentError::NotFound(source_uri.to_string()));
        }

        let snapshot = HostDirSnapshot::capture(dir)?;
        self.ensure_container()?;
        self.container.upload(&snapshot, dest)?;

        self.history.push(HistoryEntry::new(
            format!("Upload {source_uri} -> {dest}"),
            explanation,
        ));
        Ok(())
    }

    /// Tear down the triple. Best-effort: one missing artifact never blocks
    /// removal of the others. The mirror branch is retained so the work stays
    /// inspectable.
    pub fn delete(&mut self) -> Result<()> {
        if let Err(e) = self.container.remove(true) {
            tracing::warn!(container = %self.container.name, error = %e, "container removal failed");
        }
        if !self.image_tag.is_empty() {
            if let Err(e) = self.engine.remove_image(&self.image_tag) {
                tracing::warn!(image = %self.image_tag, error = %e, "image removal failed");
            }
        }
        if let Err(e) = self.manager.remove_worktree(&self.source, &self.id) {
            tracing::warn!(id = %self.id, error = %e, "worktree removal failed");
        }
        if let Err(e) = self.manager.delete_branch_from_source(&self.source, &self.id) {
            tracing::warn!(id = %self.id, error = %e, "source branch removal failed");
        }
        Ok(())
    }

    fn write_state_note(&self, commit: Option<&str>) -> Result<()> {
        let payload = self.state().encode()?;
        // State-only changes anchor on the current tip; commits never go empty.
        let rev = commit.unwrap_or("HEAD");
        self.git.notes_append(NOTES_STATE_REF, rev, &payload)?;
        Ok(())
    }

    /// Build the image from the current configuration and a call-time
    /// worktree snapshot, then replace the running container.
    fn rebuild_container(&mut self) -> Result<()> {
        let snapshot = HostDirSnapshot::capture(&self.worktree)?;
        let spec = BuildSpec {
            base_image: self.base_image.clone(),
            setup_commands: self.setup_commands.clone(),
            env: self.env.clone(),
            secrets: self.resolve_secrets(),
        };
        // The snapshot fingerprint is part of the tag, so a mutated worktree
        // can never alias an earlier build.
        let tag = format!(
            "container-use/{}:{}",
            self.id.replace('/', "-"),
            snapshot.tag_suffix()
        );
        self.engine.build(&tag, &spec, &snapshot)?;
        self.image_tag = tag;
        self.replace_container()
    }

    fn replace_container(&mut self) -> Result<()> {
        if self.container.exists().unwrap_or(false) {
            if let Err(e) = self.container.remove(true) {
                tracing::warn!(container = %self.container.name, error = %e, "stale container removal failed");
            }
        }
        self.container.start(&self.image_tag, &self.env)?;
        Ok(())
    }

    fn ensure_container(&mut self) -> Result<()> {
        if self.container.is_running()? {
            return Ok(());
        }
        if self.image_tag.is_empty() {
            return self.rebuild_container();
        }
        self.replace_container()
    }

    fn resolve_secrets(&self) -> Vec<(String, String)> {
        self.secrets
            .iter()
            .filter_map(|reference| match resolve_secret(reference) {
                Some(pair) => Some(pair),
                None => {
                    tracing::warn!(reference = %reference, "secret could not be resolved");
                    None
                }
            })
            .collect()
    }
}

/// Resolve a secret reference (`NAME=env://VAR` or `NAME=file:///path`) to a
/// `(NAME, value)` pair.
fn resolve_secret(reference: &str) -> Option<(String, String)> {
    let (name, target) = reference.split_once('=')?;
    if let Some(var) = target.strip_prefix("env://") {
        std::env::var(var).ok().map(|v| (name.to_string(), v))
    } else if let Some(path) = target.strip_prefix("file://") {
        std::fs::read_to_string(path)
            .ok()
            .map(|v| (name.to_string(), v.trim_end().to_string()))
    } else {
        None
    }
}

/// Classify a path: `Ok(Some(rel))` for paths inside `/workdir` (mirrored to
/// the worktree), `Ok(None)` for other absolute container paths. Traversal
/// components are rejected before anything touches the host filesystem.
fn workdir_relative(path: &str) -> Result<Option<String>> {
    if path.is_empty() {
        return Err(EnvironmentError::InvalidArgument(
            "path must not be empty".to_string(),
        ));
    }
    if path.split('/').any(|component| component == "..") {
        return Err(EnvironmentError::InvalidArgument(format!(
            "path must not contain '..': {path}"
        )));
    }

    let rel = if let Some(rest) = path.strip_prefix("/workdir/") {
        rest
    } else if path == WORKDIR {
        return Err(EnvironmentError::InvalidArgument(
            "path is the workdir itself".to_string(),
        ));
    } else if path.starts_with('/') {
        return Ok(None);
    } else {
        path
    };

    let rel = rel.trim_start_matches("./").trim_matches('/');
    if rel.is_empty() {
        return Err(EnvironmentError::InvalidArgument(format!(
            "path resolves to nothing: {path}"
        )));
    }
    Ok(Some(rel.to_string()))
}

/// Strip one trailing carriage return per line.
fn strip_trailing_cr(text: &str) -> String {
    let lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .collect();
    lines.join("\n")
}
