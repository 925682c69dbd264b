// Docker CLI adapter. Images are produced without a Dockerfile: a throwaway
// builder container runs from the base image, the worktree snapshot is copied
// to /workdir, the setup-command chain runs in order, and the result is
// committed as the new image.

use std::path::Path;
use std::process::{Command, Stdio};

use serde_json::Value;

use super::engine_interface::{
    BuildSpec, ContainerEngineInterface, ExecResult, HostDirSnapshot, WORKDIR,
};
use super::error::{ContainerError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct DockerEngine;

// Double-quote escaping so values survive inside a single-quoted outer
// wrapper when interpolated into `sh -c '...'` strings.
pub(crate) fn shell_escape(val: &str) -> String {
    let escaped = val
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`");
    format!("\"{}\"", escaped)
}

fn docker(args: &[&str]) -> Result<std::process::Output> {
    Ok(Command::new("docker").args(args).output()?)
}

fn classify_failure(context: &str, name: &str, stderr: &str) -> ContainerError {
    if stderr.contains("permission denied") {
        return ContainerError::PermissionDenied;
    }
    if stderr.contains("Cannot connect to the Docker daemon") {
        return ContainerError::DaemonNotRunning;
    }
    if stderr.contains("No such container") {
        return ContainerError::ContainerNotFound(name.to_string());
    }
    if stderr.contains("No such image") || stderr.contains("Unable to find image") {
        return ContainerError::ImageNotFound(stderr.trim().to_string());
    }
    ContainerError::CommandFailed(format!("{context}: {}", stderr.trim()))
}

impl DockerEngine {
    fn cleanup_builder(&self, name: &str) {
        if let Err(e) = self.remove(name, true) {
            tracing::debug!(builder = %name, error = %e, "builder cleanup skipped");
        }
    }

    // Copies the snapshot's entries into the container, leaving .git behind:
    // the worktree's gitdir pointer is host-specific and the audit trail
    // lives outside the container.
    fn copy_snapshot(&self, name: &str, snapshot: &HostDirSnapshot, dest: &str) -> Result<()> {
        for entry in std::fs::read_dir(snapshot.path())? {
            let entry = entry?;
            if entry.file_name() == ".git" {
                continue;
            }
            let src = entry.path();
            let target = format!("{name}:{dest}/");
            let output = docker(&["cp", &src.to_string_lossy(), &target])?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(classify_failure("docker cp", name, &stderr));
            }
        }
        Ok(())
    }

    fn entrypoint(&self, name: &str) -> Result<Vec<String>> {
        let output = docker(&["inspect", name])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("docker inspect", name, &stderr));
        }

        let parsed: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| ContainerError::CommandFailed(e.to_string()))?;
        let Some(Value::Array(items)) = parsed.pointer("/0/Config/Entrypoint").cloned() else {
            return Ok(Vec::new());
        };
        Ok(items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }
}

impl ContainerEngineInterface for DockerEngine {
    fn is_available(&self) -> bool {
        Command::new("docker")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn is_daemon_running(&self) -> bool {
        Command::new("docker")
            .args(["info"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn build(
        &self,
        image_tag: &str,
        spec: &BuildSpec,
        worktree: &HostDirSnapshot,
    ) -> Result<String> {
        let builder = format!("cu-build-{}", worktree.tag_suffix());
        self.cleanup_builder(&builder);

        tracing::info!(image = %spec.base_image, tag = %image_tag, "building environment image");

        let mut run_args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            builder.clone(),
            "-w".into(),
            WORKDIR.into(),
        ];
        for pair in &spec.env {
            run_args.push("-e".into());
            run_args.push(pair.clone());
        }
        run_args.push(spec.base_image.clone());
        run_args.push("sleep".into());
        run_args.push("infinity".into());

        let args: Vec<&str> = run_args.iter().map(String::as_str).collect();
        let output = docker(&args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("docker run", &builder, &stderr));
        }

        let result = (|| -> Result<String> {
            let output = docker(&["exec", &builder, "mkdir", "-p", WORKDIR])?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(classify_failure("mkdir workdir", &builder, &stderr));
            }

            self.copy_snapshot(&builder, worktree, WORKDIR)?;

            for command in &spec.setup_commands {
                // Secrets are exported on the exec only, never baked into
                // image config.
                let mut exec_args: Vec<String> = vec!["exec".into()];
                for (key, value) in &spec.secrets {
                    exec_args.push("-e".into());
                    exec_args.push(format!("{key}={value}"));
                }
                exec_args.push(builder.clone());
                exec_args.push("sh".into());
                exec_args.push("-c".into());
                exec_args.push(command.clone());

                let args: Vec<&str> = exec_args.iter().map(String::as_str).collect();
                let output = docker(&args)?;
                if !output.status.success() {
                    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
                    combined.push_str(&String::from_utf8_lossy(&output.stderr));
                    return Err(ContainerError::BuildStepFailed {
                        command: command.clone(),
                        exit_code: output.status.code().unwrap_or(-1),
                        output: combined,
                    });
                }
                tracing::debug!(command = %command, "setup command succeeded");
            }

            let output = docker(&["commit", &builder, image_tag])?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(ContainerError::CommandFailed(format!(
                    "docker commit: {}",
                    stderr.trim()
                )));
            }
            Ok(image_tag.to_string())
        })();

        self.cleanup_builder(&builder);
        result
    }

    fn start(&self, name: &str, image: &str, env: &[String]) -> Result<String> {
        if self.exists(name)? {
            return Err(ContainerError::ContainerAlreadyExists(name.to_string()));
        }

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "-w".into(),
            WORKDIR.into(),
        ];
        for pair in env {
            args.push("-e".into());
            args.push(pair.clone());
        }
        args.push(image.into());
        args.push("sleep".into());
        args.push("infinity".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = docker(&arg_refs)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such image") || stderr.contains("Unable to find image") {
                return Err(ContainerError::ImageNotFound(image.to_string()));
            }
            return Err(ContainerError::StartFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn exec(
        &self,
        name: &str,
        command: &str,
        shell: &str,
        use_entrypoint: bool,
    ) -> Result<ExecResult> {
        let mut args: Vec<String> = vec!["exec".into(), name.into()];
        if use_entrypoint {
            let entrypoint = self.entrypoint(name)?;
            if entrypoint.is_empty() {
                args.push(shell.into());
                args.push("-c".into());
            } else {
                args.extend(entrypoint);
            }
        } else {
            args.push(shell.into());
            args.push("-c".into());
        }
        args.push(command.into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = docker(&arg_refs)?;

        // The command's own exit code is not an engine failure; only daemon
        // and missing-container conditions are.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success()
            && (stderr.contains("No such container")
                || stderr.contains("Cannot connect to the Docker daemon")
                || stderr.contains("is not running"))
        {
            return Err(classify_failure("docker exec", name, &stderr));
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&stderr);
        Ok(ExecResult {
            output: combined,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    fn read_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let output = docker(&["exec", name, "cat", path])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such file") || stderr.contains("Is a directory") {
                return Err(ContainerError::FileNotFound(path.to_string()));
            }
            return Err(classify_failure("docker exec cat", name, &stderr));
        }
        Ok(output.stdout)
    }

    fn write_file(&self, name: &str, path: &str, contents: &[u8]) -> Result<()> {
        use std::io::Write;

        let parent = match path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir,
            _ => ".",
        };
        let script = format!(
            "mkdir -p {} && cat > {}",
            shell_escape(parent),
            shell_escape(path)
        );

        let mut child = Command::new("docker")
            .args(["exec", "-i", name, "sh", "-c", &script])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        child
            .stdin
            .as_mut()
            .expect("stdin was piped")
            .write_all(contents)?;
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("docker exec write", name, &stderr));
        }
        Ok(())
    }

    fn upload(&self, name: &str, source: &HostDirSnapshot, dest: &str) -> Result<()> {
        let output = docker(&["exec", name, "mkdir", "-p", dest])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("mkdir upload dest", name, &stderr));
        }

        // The `/.` suffix copies directory contents, not the directory.
        let src = format!("{}/.", source.path().to_string_lossy());
        let target = format!("{name}:{dest}");
        let output = docker(&["cp", &src, &target])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("docker cp upload", name, &stderr));
        }
        tracing::debug!(fingerprint = %source.tag_suffix(), dest = %dest, "uploaded directory");
        Ok(())
    }

    fn export_workdir(&self, name: &str, host_dir: &Path) -> Result<()> {
        let src = format!("{name}:{WORKDIR}/.");
        let output = docker(&["cp", &src, &host_dir.to_string_lossy()])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure("docker cp export", name, &stderr));
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let output = docker(&["container", "inspect", name])?;
        Ok(output.status.success())
    }

    fn is_running(&self, name: &str) -> Result<bool> {
        let output = docker(&["inspect", name])?;
        if !output.status.success() {
            return Ok(false);
        }

        let parsed: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| ContainerError::CommandFailed(e.to_string()))?;
        Ok(parsed.pointer("/0/State/Running") == Some(&Value::Bool(true)))
    }

    fn stop(&self, name: &str) -> Result<()> {
        let output = docker(&["stop", name])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                return Err(ContainerError::ContainerNotFound(name.to_string()));
            }
            return Err(ContainerError::StopFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(name);

        let output = docker(&args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such container") {
                return Err(ContainerError::ContainerNotFound(name.to_string()));
            }
            return Err(ContainerError::RemoveFailed(stderr.trim().to_string()));
        }
        Ok(())
    }

    fn remove_image(&self, tag: &str) -> Result<()> {
        let output = docker(&["rmi", "-f", tag])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such image") {
                return Err(ContainerError::CommandFailed(stderr.trim().to_string()));
            }
        }
        Ok(())
    }
}
