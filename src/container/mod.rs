// Container engine adapter: the abstract capability (build, start, exec,
// read, write, upload, export) dispatched over ContainerEngine; Docker via
// its CLI is the only backend today.

mod docker;
pub mod engine_interface;
pub mod error;

pub use docker::DockerEngine;
pub use engine_interface::{
    BuildSpec, ContainerEngineInterface, ExecResult, HostDirSnapshot, WORKDIR,
};
pub use error::{ContainerError, Result};

use enum_dispatch::enum_dispatch;
use std::path::Path;

#[enum_dispatch(ContainerEngineInterface)]
#[derive(Debug, Clone)]
pub enum ContainerEngine {
    DockerEngine,
}

impl Default for ContainerEngine {
    fn default() -> Self {
        DockerEngine.into()
    }
}

// A named container bound to its engine, so callers don't thread names
// around.
#[derive(Debug, Clone)]
pub struct SandboxContainer {
    pub name: String,
    engine: ContainerEngine,
}

impl SandboxContainer {
    pub fn new(environment_id: &str, engine: ContainerEngine) -> Self {
        Self {
            name: Self::generate_name(environment_id),
            engine,
        }
    }

    // Docker names cannot carry '/'.
    pub fn generate_name(environment_id: &str) -> String {
        format!("cu-{}", environment_id.replace('/', "-"))
    }

    pub fn exists(&self) -> Result<bool> {
        self.engine.exists(&self.name)
    }

    pub fn is_running(&self) -> Result<bool> {
        self.engine.is_running(&self.name)
    }

    pub fn start(&self, image: &str, env: &[String]) -> Result<String> {
        self.engine.start(&self.name, image, env)
    }

    pub fn exec(&self, command: &str, shell: &str, use_entrypoint: bool) -> Result<ExecResult> {
        self.engine.exec(&self.name, command, shell, use_entrypoint)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.engine.read_file(&self.name, path)
    }

    pub fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.engine.write_file(&self.name, path, contents)
    }

    pub fn upload(&self, source: &HostDirSnapshot, dest: &str) -> Result<()> {
        self.engine.upload(&self.name, source, dest)
    }

    pub fn export_workdir(&self, host_dir: &Path) -> Result<()> {
        self.engine.export_workdir(&self.name, host_dir)
    }

    pub fn stop(&self) -> Result<()> {
        self.engine.stop(&self.name)
    }

    pub fn remove(&self, force: bool) -> Result<()> {
        self.engine.remove(&self.name, force)
    }
}
