//! Turns an [`AgentSpawnSpec`] into a live [`AcpAdapter`].
//!
//! `RunnerKind::Sandboxed`/`Containerized` are thin wrappers that change
//! how the underlying command is constructed; they do not implement a
//! sandbox policy engine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{AcpAdapter, AcpError, AgentSpawnSpec, DirectAdapter, RunnerKind};

#[async_trait]
pub trait AcpLauncher: Send + Sync {
    async fn launch(&self, spec: &AgentSpawnSpec) -> Result<Arc<dyn AcpAdapter>, AcpError>;
}

/// Spawns the agent command exactly as given.
pub struct DirectLauncher;

#[async_trait]
impl AcpLauncher for DirectLauncher {
    async fn launch(&self, spec: &AgentSpawnSpec) -> Result<Arc<dyn AcpAdapter>, AcpError> {
        DirectAdapter::spawn(spec.working_dir.clone(), spec.command.clone(), spec.args.clone())
            .await
    }
}

/// Wraps the command with a sandbox profile invocation before spawning
/// it directly. The profile name is passed through verbatim to whatever
/// sandboxing tool is on `PATH`; this crate does not interpret it.
pub struct SandboxedLauncher {
    inner: DirectLauncher,
}

impl Default for SandboxedLauncher {
    fn default() -> Self {
        Self { inner: DirectLauncher }
    }
}

#[async_trait]
impl AcpLauncher for SandboxedLauncher {
    async fn launch(&self, spec: &AgentSpawnSpec) -> Result<Arc<dyn AcpAdapter>, AcpError> {
        let RunnerKind::Sandboxed { profile } = &spec.runner else {
            return Err(AcpError::Unavailable(
                "SandboxedLauncher invoked with a non-sandboxed spec".into(),
            ));
        };
        let wrapped = AgentSpawnSpec {
            command: "sandbox-exec".to_string(),
            args: [
                vec!["-p".to_string(), profile.clone(), "--".to_string(), spec.command.clone()],
                spec.args.clone(),
            ]
            .concat(),
            working_dir: spec.working_dir.clone(),
            runner: RunnerKind::Direct,
        };
        self.inner.launch(&wrapped).await
    }
}

/// Wraps the command in a container image entrypoint before spawning it
/// directly. No image pulling, resource limits, or network policy is
/// implemented here.
pub struct ContainerizedLauncher {
    inner: DirectLauncher,
}

impl Default for ContainerizedLauncher {
    fn default() -> Self {
        Self { inner: DirectLauncher }
    }
}

#[async_trait]
impl AcpLauncher for ContainerizedLauncher {
    async fn launch(&self, spec: &AgentSpawnSpec) -> Result<Arc<dyn AcpAdapter>, AcpError> {
        let RunnerKind::Containerized { image } = &spec.runner else {
            return Err(AcpError::Unavailable(
                "ContainerizedLauncher invoked with a non-containerized spec".into(),
            ));
        };
        let mount = format!("{}:/workspace", spec.working_dir.display());
        let wrapped = AgentSpawnSpec {
            command: "docker".to_string(),
            args: [
                vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "-i".to_string(),
                    "-v".to_string(),
                    mount,
                    "-w".to_string(),
                    "/workspace".to_string(),
                    image.clone(),
                    spec.command.clone(),
                ],
                spec.args.clone(),
            ]
            .concat(),
            working_dir: spec.working_dir.clone(),
            runner: RunnerKind::Direct,
        };
        self.inner.launch(&wrapped).await
    }
}
