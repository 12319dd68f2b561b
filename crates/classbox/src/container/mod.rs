//! Container runtime management module.
//!
//! Two layers:
//! - [`ContainerRuntimeApi`]: a fallible async interface to the runtime's
//!   control API. [`DockerRuntime`] implements it on the Docker Engine API
//!   (Docker or Podman's compatible socket) and the runtime CLI for builds.
//! - [`RuntimeClient`]: the facade used by the orchestrator and the terminal
//!   bridge. It logs failures and reduces them to plain negative results.

mod client;
mod container;
mod docker;
mod error;

#[cfg(test)]
pub(crate) mod fake;

pub use client::RuntimeClient;
pub use container::{
    ContainerConfig, ContainerState, ContainerStatus, ExecSpec, PortMapping,
    validate_container_name, validate_env_var_key, validate_image_name,
};
pub use docker::DockerRuntime;
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncWrite;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default CLI binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Runtime connection and resource settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Which runtime CLI is used for image builds.
    pub runtime: RuntimeType,
    /// Explicit CLI binary path (defaults to the runtime's binary name).
    pub binary: Option<String>,
    /// Engine API endpoint (`unix:///run/docker.sock`, `tcp://host:2375`).
    /// Uses the local defaults when unset.
    pub docker_host: Option<String>,
    /// Timeout for individual API requests, in seconds.
    pub api_timeout_secs: u64,
    /// CPUs granted to each project container.
    pub cpu_count: f64,
    /// Memory limit for each project container, in megabytes.
    pub memory_limit_mb: u64,
    /// Grace period before a stop turns into a kill, in seconds.
    pub stop_timeout_secs: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeType::Docker,
            binary: None,
            docker_host: None,
            api_timeout_secs: 120,
            cpu_count: 1.0,
            memory_limit_mb: 1024,
            stop_timeout_secs: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn binary(&self) -> &str {
        self.binary
            .as_deref()
            .unwrap_or_else(|| self.runtime.default_binary())
    }

    /// Limits end up on every project container, so a bad value would make
    /// every start fail.
    pub fn validate(&self) -> ContainerResult<()> {
        if !self.cpu_count.is_finite() || self.cpu_count <= 0.0 {
            return Err(ContainerError::InvalidInput(format!(
                "cpu_count must be a positive number, got {}",
                self.cpu_count
            )));
        }
        if self.memory_limit_mb == 0 {
            return Err(ContainerError::InvalidInput(
                "memory_limit_mb must be positive".to_string(),
            ));
        }
        if self.api_timeout_secs == 0 {
            return Err(ContainerError::InvalidInput(
                "api_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ordered output chunks from an exec'd process.
pub type ExecOutput = BoxStream<'static, ContainerResult<Bytes>>;

/// Write side of an exec'd process (its stdin).
pub type ExecInput = Pin<Box<dyn AsyncWrite + Send>>;

/// A live, attached exec instance.
pub struct ExecStream {
    /// Runtime identifier of the exec instance, used for resizing.
    pub exec_id: String,
    pub output: ExecOutput,
    pub input: ExecInput,
}

impl std::fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecStream")
            .field("exec_id", &self.exec_id)
            .finish_non_exhaustive()
    }
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Check that the control plane answers.
    async fn ping(&self) -> ContainerResult<()>;

    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;

    /// Raw runtime status (`"running"`, `"exited"`, ...), `None` if the
    /// container does not exist.
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;

    /// Build `image` from the directory `context`, discarding intermediate
    /// containers whatever the outcome. Blocks until the build finishes.
    async fn build_image(&self, image: &str, context: &Path) -> ContainerResult<()>;

    /// Create and start a container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    async fn start_container(&self, id_or_name: &str) -> ContainerResult<()>;

    async fn stop_container(
        &self,
        id_or_name: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;

    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()>;

    /// Spawn a process inside a running container and attach to its stdio.
    async fn open_exec(&self, container: &str, spec: &ExecSpec) -> ContainerResult<ExecStream>;

    /// Resize the pseudo-terminal of an exec instance.
    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> ContainerResult<()>;

    /// Execute a command in a container and return its stdout.
    async fn exec_output(&self, container: &str, command: &[&str]) -> ContainerResult<String>;
}
