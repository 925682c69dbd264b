//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use container_use::container::{ContainerEngineInterface, DockerEngine};
use container_use::Service;
use tempfile::TempDir;

/// A throwaway source repository plus an isolated config dir.
pub struct TestRepo {
    repo_dir: TempDir,
    config_dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let repo_dir = TempDir::new().expect("create repo dir");
        let config_dir = TempDir::new().expect("create config dir");

        let te = Self {
            repo_dir,
            config_dir,
        };
        te.git(&["init"]);
        te.git(&["config", "user.email", "test@example.com"]);
        te.git(&["config", "user.name", "Test User"]);
        te.git(&["config", "commit.gpgsign", "false"]);
        te
    }

    pub fn repo_path(&self) -> &Path {
        self.repo_dir.path()
    }

    pub fn config_path(&self) -> &Path {
        self.config_dir.path()
    }

    /// A service bound to this fixture's isolated config dir. No global
    /// state: parallel tests never interfere.
    pub fn service(&self) -> Service {
        Service::new(self.config_dir.path())
    }

    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.repo_dir.path())
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    pub fn git_in(&self, dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).to_string()
    }

    pub fn write_file(&self, path: &str, content: &str) {
        let full = self.repo_dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).expect("create parent dir");
        std::fs::write(full, content).expect("write file");
    }

    pub fn write_binary_file(&self, path: &str, size: usize) {
        let content: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        let full = self.repo_dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).expect("create parent dir");
        std::fs::write(full, content).expect("write binary file");
    }

    pub fn create_dir(&self, path: &str) {
        std::fs::create_dir_all(self.repo_dir.path().join(path)).expect("create dir");
    }

    pub fn git_commit(&self, message: &str) {
        self.git(&["add", "."]);
        self.git(&["commit", "-m", message]);
    }

    pub fn git_status(&self) -> String {
        self.git(&["status", "--porcelain"])
    }

    pub fn setup_python_project(&self) {
        self.write_file(
            "main.py",
            "def main():\n    print('Hello World')\n\nif __name__ == '__main__':\n    main()\n",
        );
        self.write_file("utils.py", "def helper():\n    return 42\n");
        self.write_file("requirements.txt", "requests==2.31.0\nnumpy==1.24.0\n");
        self.write_file(".gitignore", "__pycache__/\n*.pyc\n.env\nvenv/\n");
        self.git_commit("Initial Python project");
    }

    pub fn setup_node_project(&self) {
        self.write_file(
            "package.json",
            r#"{
  "name": "test-project",
  "version": "1.0.0",
  "main": "index.js"
}"#,
        );
        self.write_file("index.js", "console.log('Hello from Node.js');\n");
        self.write_file(".gitignore", "node_modules/\n.env\n");
        self.git_commit("Initial Node project");
    }

    pub fn setup_empty_project(&self) {
        self.write_file("README.md", "# Test Project\n");
        self.git_commit("Initial commit");
    }

    /// Worktree path for an environment of this fixture.
    pub fn worktree_path(&self, id: &str) -> PathBuf {
        let project = self
            .repo_dir
            .path()
            .canonicalize()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string();
        self.config_dir
            .path()
            .join("worktrees")
            .join(project)
            .join(id)
    }
}

/// Container-backed tests skip when no docker daemon is reachable, the same
/// way the teacher's docker tests and the original's dagger tests do.
pub fn docker_available() -> bool {
    let engine = DockerEngine;
    if !engine.is_available() || !engine.is_daemon_running() {
        eprintln!("skipping: docker not available");
        return false;
    }
    true
}
