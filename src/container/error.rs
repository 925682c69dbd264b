use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error(
        "Docker is not installed or not in PATH.\n\
         Install Docker: https://docs.docker.com/get-docker/"
    )]
    NotInstalled,

    #[error(
        "Docker daemon is not running.\n\
         Start Docker Desktop or run: sudo systemctl start docker"
    )]
    DaemonNotRunning,

    #[error("Docker permission denied")]
    PermissionDenied,

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerAlreadyExists(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Setup command '{command}' failed with exit code {exit_code}:\n{output}")]
    BuildStepFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Failed to stop container: {0}")]
    StopFailed(String),

    #[error("Failed to remove container: {0}")]
    RemoveFailed(String),

    #[error("File not found in container: {0}")]
    FileNotFound(String),

    #[error("File is not valid UTF-8: {0}")]
    NotUtf8(String),

    #[error("Container command failed: {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ContainerError>;
