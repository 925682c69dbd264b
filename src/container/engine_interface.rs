// Abstract container engine capability. Any runtime exposing these
// operations can back an environment.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use super::error::Result;
use enum_dispatch::enum_dispatch;

// Where the worktree lives inside every container.
pub const WORKDIR: &str = "/workdir";

// A host directory captured at call time. The fingerprint folds each file's
// path, length, and mtime, and participates in image identity, so two
// different worktree states can never alias to one cached image. Every
// operation taking a host directory as input captures a fresh snapshot;
// nothing memoizes a directory handle across calls.
#[derive(Debug, Clone)]
pub struct HostDirSnapshot {
    path: PathBuf,
    fingerprint: u64,
}

impl HostDirSnapshot {
    pub fn capture(path: &Path) -> std::io::Result<Self> {
        let mut hasher = DefaultHasher::new();
        hash_dir(path, path, &mut hasher)?;
        Ok(Self {
            path: path.to_path_buf(),
            fingerprint: hasher.finish(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn tag_suffix(&self) -> String {
        format!("{:016x}", self.fingerprint)
    }
}

fn hash_dir(root: &Path, dir: &Path, hasher: &mut DefaultHasher) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let path = entry.path();
        let metadata = std::fs::metadata(&path)?;
        if metadata.is_dir() {
            hash_dir(root, &path, hasher)?;
        } else {
            path.strip_prefix(root).unwrap_or(&path).hash(hasher);
            metadata.len().hash(hasher);
            if let Ok(mtime) = metadata.modified() {
                mtime.hash(hasher);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct BuildSpec {
    pub base_image: String,
    // Applied in order; a non-zero exit fails the build.
    pub setup_commands: Vec<String>,
    // KEY=VALUE pairs baked into the container environment.
    pub env: Vec<String>,
    // Resolved secret values, exported only while setup commands run.
    pub secrets: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub output: String,
    pub exit_code: i32,
}

#[enum_dispatch]
pub trait ContainerEngineInterface {
    fn is_available(&self) -> bool;

    fn is_daemon_running(&self) -> bool;

    fn build(&self, image_tag: &str, spec: &BuildSpec, worktree: &HostDirSnapshot)
        -> Result<String>;

    fn start(&self, name: &str, image: &str, env: &[String]) -> Result<String>;

    fn exec(&self, name: &str, command: &str, shell: &str, use_entrypoint: bool)
        -> Result<ExecResult>;

    fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>>;

    fn write_file(&self, name: &str, path: &str, contents: &[u8]) -> Result<()>;

    fn upload(&self, name: &str, source: &HostDirSnapshot, dest: &str) -> Result<()>;

    fn export_workdir(&self, name: &str, host_dir: &Path) -> Result<()>;

    fn exists(&self, name: &str) -> Result<bool>;

    fn is_running(&self, name: &str) -> Result<bool>;

    fn stop(&self, name: &str) -> Result<()>;

    fn remove(&self, name: &str, force: bool) -> Result<()>;

    fn remove_image(&self, tag: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_fingerprint_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("script.sh"), "echo Version 1").unwrap();

        let first = HostDirSnapshot::capture(dir.path()).unwrap();

        // Rewrite with different length so the fingerprint must move even on
        // filesystems with coarse mtime granularity.
        std::fs::write(dir.path().join("script.sh"), "echo Version 2 changed").unwrap();
        let second = HostDirSnapshot::capture(dir.path()).unwrap();

        assert_ne!(first.fingerprint(), second.fingerprint());
        assert_ne!(first.tag_suffix(), second.tag_suffix());
    }

    #[test]
    fn test_snapshot_ignores_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let before = HostDirSnapshot::capture(dir.path()).unwrap();

        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "noise").unwrap();
        let after = HostDirSnapshot::capture(dir.path()).unwrap();

        assert_eq!(before.fingerprint(), after.fingerprint());
    }

    #[test]
    fn test_snapshot_is_stable_for_unchanged_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "b").unwrap();

        let first = HostDirSnapshot::capture(dir.path()).unwrap();
        let second = HostDirSnapshot::capture(dir.path()).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }
}
