// Git plumbing: subprocess execution, selective staging, commits, notes.

use std::path::{Path, PathBuf};
use std::process::Command;

pub mod error;

pub use error::{GitError, Result};

// Notes refs: command transcripts (log) and serialized environment state.
pub const NOTES_LOG_REF: &str = "container-use";
pub const NOTES_STATE_REF: &str = "container-use-state";

// Fixed bot identity so user git config never interferes with commits.
pub const BOT_NAME: &str = "container-use";
pub const BOT_EMAIL: &str = "container-use@localhost";

// Regular files larger than this are never staged.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

const BINARY_SNIFF_LEN: usize = 8192;

// Conventional build/cache output, never staged. Ignored paths are excluded
// by git itself (they don't show up in porcelain status).
const SKIP_DIR_NAMES: &[&str] = &[
    "__pycache__",
    "node_modules",
    "target",
    "build",
    "dist",
    "venv",
    ".venv",
    ".cache",
];

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_git_repo(path: &Path) -> bool {
        git2::Repository::discover(path).is_ok()
    }

    pub fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()?;
        self.finish(args, output)
    }

    fn run_as_bot(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_AUTHOR_NAME", BOT_NAME)
            .env("GIT_AUTHOR_EMAIL", BOT_EMAIL)
            .env("GIT_COMMITTER_NAME", BOT_NAME)
            .env("GIT_COMMITTER_EMAIL", BOT_EMAIL)
            .output()?;
        self.finish(args, output)
    }

    fn finish(&self, args: &[&str], output: std::process::Output) -> Result<String> {
        if !output.status.success() {
            let command = args.join(" ");
            // No exit code means the subprocess died from a signal.
            if output.status.code().is_none() {
                return Err(GitError::Canceled(command));
            }
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::debug!(command = %command, stderr = %stderr, "git command failed");
            return Err(GitError::CommandFailed { command, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn current_branch(&self) -> Result<String> {
        let out = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    pub fn head_sha(&self) -> Result<String> {
        let out = self.run(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    pub fn status_porcelain(&self) -> Result<String> {
        self.run(&["status", "--porcelain=v1", "-uall"])
    }

    // Stage everything `git add .` would, minus binary files, files under
    // conventional build/cache directories, and oversized files. Empty
    // directories never appear in status; binary-only directories end up
    // fully skipped and stay untracked.
    pub fn add_non_binary(&self) -> Result<()> {
        self.add_non_binary_with_limit(DEFAULT_MAX_FILE_SIZE)
    }

    pub fn add_non_binary_with_limit(&self, max_file_size: u64) -> Result<()> {
        let status = self.status_porcelain()?;
        let mut accepted: Vec<String> = Vec::new();

        for line in status.lines() {
            let Some((code, path)) = parse_status_line(line) else {
                continue;
            };

            // Deletions have no file to classify; staging records the removal.
            if code.contains('D') {
                accepted.push(path);
                continue;
            }

            if in_skipped_dir(&path) {
                tracing::debug!(path = %path, "skipping cache directory entry");
                continue;
            }

            let full = self.workdir.join(&path);
            let Ok(metadata) = std::fs::metadata(&full) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            if metadata.len() > max_file_size {
                tracing::debug!(path = %path, size = metadata.len(), "skipping oversized file");
                continue;
            }
            if is_binary_file(&full)? {
                tracing::debug!(path = %path, "skipping binary file");
                continue;
            }

            accepted.push(path);
        }

        if accepted.is_empty() {
            return Ok(());
        }

        for chunk in accepted.chunks(128) {
            let mut args: Vec<&str> = vec!["add", "--"];
            args.extend(chunk.iter().map(String::as_str));
            self.run(&args)?;
        }

        Ok(())
    }

    // Commit staged changes as the bot user with message `<name>\n\n<explanation>`.
    // Returns None when nothing is staged; empty commits never appear on
    // environment branches.
    pub fn commit_if_dirty(&self, name: &str, explanation: &str) -> Result<Option<String>> {
        if !self.has_staged_changes()? {
            return Ok(None);
        }

        let message = format!("{}\n\n{}", name, explanation);
        self.run_as_bot(&["-c", "commit.gpgsign=false", "commit", "-m", &message])?;
        let sha = self.head_sha()?;
        tracing::debug!(commit = %sha, name = %name, "created commit");
        Ok(Some(sha))
    }

    fn has_staged_changes(&self) -> Result<bool> {
        let status = self.run(&["status", "--porcelain"])?;
        Ok(status
            .lines()
            .any(|line| matches!(line.chars().next(), Some(c) if c != ' ' && c != '?')))
    }

    pub fn notes_append(&self, ref_name: &str, rev: &str, message: &str) -> Result<()> {
        self.run(&["notes", "--ref", ref_name, "append", "-m", message, rev])?;
        Ok(())
    }

    pub fn notes_show(&self, ref_name: &str, rev: &str) -> Result<String> {
        self.run(&["notes", "--ref", ref_name, "show", rev])
    }

    // (note object, annotated object) pairs.
    pub fn notes_list(&self, ref_name: &str) -> Result<Vec<(String, String)>> {
        let out = self.run(&["notes", "--ref", ref_name, "list"])?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                Some((parts.next()?.to_string(), parts.next()?.to_string()))
            })
            .collect())
    }

    // Root commit over the empty tree, for sources with no commits yet.
    // Plumbing only; no worktree or index involved.
    pub fn create_empty_root_commit(&self) -> Result<String> {
        let tree = self.hash_empty_tree()?;
        let sha = self.run_as_bot(&["commit-tree", &tree, "-m", "Initial commit"])?;
        Ok(sha.trim().to_string())
    }

    fn hash_empty_tree(&self) -> Result<String> {
        use std::process::Stdio;

        let mut child = Command::new("git")
            .args(["hash-object", "-w", "-t", "tree", "--stdin"])
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // Empty stdin hashes the empty tree.
        drop(child.stdin.take());
        let output = child.wait_with_output()?;
        let sha = self.finish(&["hash-object", "-w", "-t", "tree", "--stdin"], output)?;
        Ok(sha.trim().to_string())
    }
}

fn parse_status_line(line: &str) -> Option<(String, String)> {
    if line.len() < 4 {
        return None;
    }
    let code = line[..2].to_string();
    let mut path = &line[3..];
    // Renames are reported as "old -> new"; the new path is what exists.
    if let Some(idx) = path.find(" -> ") {
        path = &path[idx + 4..];
    }
    let path = path.trim_matches('"').to_string();
    Some((code, path))
}

fn in_skipped_dir(path: &str) -> bool {
    path.split('/')
        .any(|component| SKIP_DIR_NAMES.contains(&component))
}

// Null-byte sniff over the leading bytes, the same heuristic git uses for
// its binary attribute detection.
fn is_binary_file(path: &Path) -> Result<bool> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; BINARY_SNIFF_LEN];
    let n = file.read(&mut buf)?;
    Ok(buf[..n].contains(&0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_repo() -> (TempDir, Git) {
        let dir = TempDir::new().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();

        let sig = git2::Signature::now("Test", "test@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            index.write_tree().unwrap()
        };
        {
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
                .unwrap();
        }

        let git = Git::new(dir.path());
        (dir, git)
    }

    fn write_file(dir: &Path, path: &str, content: &str) {
        let full = dir.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    fn write_binary_file(dir: &Path, path: &str, size: usize) {
        let content: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
        let full = dir.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    #[test]
    fn test_run_invalid_command_errors() {
        let (_dir, git) = setup_test_repo();
        let err = git.run(&["invalid-command"]).unwrap_err();
        assert!(matches!(err, GitError::CommandFailed { .. }));
    }

    #[test]
    fn test_run_in_nonexistent_directory_errors() {
        let git = Git::new("/nonexistent");
        assert!(git.run(&["status"]).is_err());
    }

    #[test]
    fn test_python_project_with_pycache() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), "main.py", "print('hello')");
        write_file(dir.path(), "utils.py", "def helper(): pass");
        write_binary_file(dir.path(), "__pycache__/main.cpython-39.pyc", 150);
        write_binary_file(dir.path(), "__pycache__/utils.cpython-39.pyc", 200);

        git.add_non_binary().unwrap();
        let status = git.status_porcelain().unwrap();

        assert!(status.contains("A  main.py"));
        assert!(status.contains("A  utils.py"));
        assert!(!status.contains("A  __pycache__"));
    }

    #[test]
    fn test_mixed_content_directory() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), "mydir/readme.txt", "Documentation");
        write_binary_file(dir.path(), "mydir/compiled.bin", 100);
        write_file(dir.path(), "mydir/script.sh", "#!/bin/bash\necho hello");
        write_binary_file(dir.path(), "mydir/image.jpg", 5000);

        git.add_non_binary().unwrap();
        let status = git.status_porcelain().unwrap();

        assert!(status.contains("A  mydir/readme.txt"));
        assert!(status.contains("A  mydir/script.sh"));
        assert!(!status.contains("A  mydir/compiled.bin"));
        assert!(!status.contains("A  mydir/image.jpg"));
    }

    #[test]
    fn test_node_modules_and_build_artifacts() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), "index.js", "console.log('app')");
        write_file(dir.path(), "node_modules/lodash/index.js", "module.exports = {}");
        write_binary_file(dir.path(), "build/app.exe", 1024);
        write_file(dir.path(), "build/config.json", r#"{"prod": true}"#);

        git.add_non_binary().unwrap();
        let status = git.status_porcelain().unwrap();

        assert!(status.contains("A  index.js"));
        assert!(!status.contains("A  node_modules"));
        assert!(!status.contains("A  build"));
    }

    #[test]
    fn test_binary_only_directory_stays_untracked() {
        let (dir, git) = setup_test_repo();
        write_binary_file(dir.path(), "blobs/a.bin", 64);
        write_binary_file(dir.path(), "blobs/b.bin", 64);

        git.add_non_binary().unwrap();
        let commit = git.commit_if_dirty("Test", "binary-only dir").unwrap();

        assert!(commit.is_none(), "nothing stageable, no commit expected");
        let status = git.status_porcelain().unwrap();
        assert!(status.contains("?? blobs/a.bin"));
    }

    #[test]
    fn test_gitignored_paths_are_not_staged() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), ".gitignore", "*.log\n");
        write_file(dir.path(), "app.py", "x = 1");
        write_file(dir.path(), "debug.log", "noise");

        git.add_non_binary().unwrap();
        let status = git.status_porcelain().unwrap();

        assert!(status.contains("A  app.py"));
        assert!(!status.contains("debug.log"));
    }

    #[test]
    fn test_oversized_file_is_skipped() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), "small.txt", "ok");
        write_file(dir.path(), "huge.txt", &"x".repeat(4096));

        git.add_non_binary_with_limit(1024).unwrap();
        let status = git.status_porcelain().unwrap();

        assert!(status.contains("A  small.txt"));
        assert!(!status.contains("A  huge.txt"));
    }

    #[test]
    fn test_empty_directories_are_ignored() {
        let (dir, git) = setup_test_repo();
        std::fs::create_dir_all(dir.path().join("empty1")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty2/nested")).unwrap();

        git.add_non_binary().unwrap();
        let commit = git.commit_if_dirty("Test", "Empty dirs").unwrap();
        assert!(commit.is_none());
    }

    #[test]
    fn test_commit_if_dirty_clean_tree_returns_none() {
        let (_dir, git) = setup_test_repo();
        let commit = git.commit_if_dirty("Test", "nothing changed").unwrap();
        assert!(commit.is_none());
    }

    #[test]
    fn test_commit_if_dirty_uses_bot_identity_and_message() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), "file.txt", "content");

        git.add_non_binary().unwrap();
        let commit = git.commit_if_dirty("Write file.txt", "Adding a file").unwrap();
        assert!(commit.is_some());

        let log = git.run(&["log", "-1", "--pretty=format:%an <%ae>%n%B"]).unwrap();
        assert!(log.contains("container-use <container-use@localhost>"));
        assert!(log.contains("Write file.txt"));
        assert!(log.contains("Adding a file"));
    }

    #[test]
    fn test_commit_deletion_is_staged() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), "doomed.txt", "bye");
        git.add_non_binary().unwrap();
        git.commit_if_dirty("Write doomed.txt", "add").unwrap();

        std::fs::remove_file(dir.path().join("doomed.txt")).unwrap();
        git.add_non_binary().unwrap();
        let commit = git.commit_if_dirty("Run rm doomed.txt", "delete").unwrap();
        assert!(commit.is_some());

        let status = git.status_porcelain().unwrap();
        assert!(status.trim().is_empty());
    }

    #[test]
    fn test_notes_append_and_show() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), "a.txt", "a");
        git.add_non_binary().unwrap();
        let commit = git.commit_if_dirty("Write a.txt", "note target").unwrap().unwrap();

        git.notes_append(NOTES_LOG_REF, &commit, "COMMAND: ls\nEXPLANATION: listing\nOUTPUT:\na.txt")
            .unwrap();

        let note = git.notes_show(NOTES_LOG_REF, &commit).unwrap();
        assert!(note.contains("COMMAND: ls"));
        assert!(note.contains("OUTPUT:"));

        let listed = git.notes_list(NOTES_LOG_REF).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1, commit);
    }

    #[test]
    fn test_notes_append_twice_extends_single_note() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), "a.txt", "a");
        git.add_non_binary().unwrap();
        let commit = git.commit_if_dirty("Write a.txt", "x").unwrap().unwrap();

        git.notes_append(NOTES_STATE_REF, &commit, "first").unwrap();
        git.notes_append(NOTES_STATE_REF, &commit, "second").unwrap();

        let note = git.notes_show(NOTES_STATE_REF, &commit).unwrap();
        assert!(note.contains("first"));
        assert!(note.contains("second"));
        assert_eq!(git.notes_list(NOTES_STATE_REF).unwrap().len(), 1);
    }

    #[test]
    fn test_notes_refs_are_independent() {
        let (dir, git) = setup_test_repo();
        write_file(dir.path(), "a.txt", "a");
        git.add_non_binary().unwrap();
        let commit = git.commit_if_dirty("Write a.txt", "x").unwrap().unwrap();

        git.notes_append(NOTES_LOG_REF, &commit, "log payload").unwrap();
        git.notes_append(NOTES_STATE_REF, &commit, "state payload").unwrap();

        assert!(git.notes_show(NOTES_LOG_REF, &commit).unwrap().contains("log payload"));
        assert!(git.notes_show(NOTES_STATE_REF, &commit).unwrap().contains("state payload"));
    }

    #[test]
    fn test_create_empty_root_commit() {
        let dir = TempDir::new().unwrap();
        git2::Repository::init_bare(dir.path()).unwrap();
        let git = Git::new(dir.path());

        let sha = git.create_empty_root_commit().unwrap();
        assert_eq!(sha.len(), 40);

        let tree = git.run(&["show", "--pretty=format:%s", &sha]).unwrap();
        assert!(tree.contains("Initial commit"));
    }

    #[test]
    fn test_is_binary_detection() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "text.txt", "plain old text\n");
        write_binary_file(dir.path(), "blob.bin", 100);

        assert!(!is_binary_file(&dir.path().join("text.txt")).unwrap());
        assert!(is_binary_file(&dir.path().join("blob.bin")).unwrap());
    }

    #[test]
    fn test_parse_status_line_rename() {
        let (code, path) = parse_status_line("R  old.txt -> new.txt").unwrap();
        assert_eq!(code, "R ");
        assert_eq!(path, "new.txt");
    }
}
