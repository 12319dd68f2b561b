//! Runtime client facade.
//!
//! Every operation tolerates an unreachable runtime: failures are logged and
//! returned as a negative result, never raised. Existence checks treat
//! "not found" as a normal `false`.

use log::{debug, error, warn};
use std::path::Path;
use std::sync::Arc;

use super::container::{ContainerConfig, ContainerState, ContainerStatus, ExecSpec};
use super::error::{ContainerError, ContainerResult};
use super::{ContainerRuntimeApi, ExecStream, RuntimeConfig};

/// Facade over a [`ContainerRuntimeApi`], shared by the orchestrator and the
/// terminal bridge.
#[derive(Clone)]
pub struct RuntimeClient {
    api: Arc<dyn ContainerRuntimeApi>,
    cpu_count: f64,
    memory_limit_mb: u64,
    stop_timeout_secs: u32,
}

impl RuntimeClient {
    pub fn new(api: Arc<dyn ContainerRuntimeApi>, config: &RuntimeConfig) -> Self {
        Self {
            api,
            cpu_count: config.cpu_count,
            memory_limit_mb: config.memory_limit_mb,
            stop_timeout_secs: config.stop_timeout_secs,
        }
    }

    /// Whether the runtime answers at all.
    pub async fn is_available(&self) -> bool {
        match self.api.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Container runtime is not reachable: {}", e);
                false
            }
        }
    }

    pub async fn image_exists(&self, name: &str) -> bool {
        match self.api.image_exists(name).await {
            Ok(exists) => exists,
            Err(e) => {
                error!("Failed to check image {}: {}", name, e);
                false
            }
        }
    }

    pub async fn container_exists(&self, name: &str) -> bool {
        match self.api.container_state_status(name).await {
            Ok(status) => status.is_some(),
            Err(e) => {
                error!("Failed to check container {}: {}", name, e);
                false
            }
        }
    }

    /// `Running` only when the runtime reports `running`; anything else,
    /// including a missing container or an unreachable runtime, is `Stopped`.
    pub async fn container_status(&self, name: &str) -> ContainerStatus {
        match self.api.container_state_status(name).await {
            Ok(Some(status)) => ContainerState::from_runtime(&status).into(),
            Ok(None) => ContainerStatus::Stopped,
            Err(e) => {
                error!("Failed to get status of container {}: {}", name, e);
                ContainerStatus::Stopped
            }
        }
    }

    /// Like [`container_status`](Self::container_status), but `None` when the
    /// runtime could not answer, so callers can keep what they already know.
    pub async fn probe_status(&self, name: &str) -> Option<ContainerStatus> {
        match self.api.container_state_status(name).await {
            Ok(Some(status)) => Some(ContainerState::from_runtime(&status).into()),
            Ok(None) => Some(ContainerStatus::Stopped),
            Err(e) => {
                warn!("Cannot probe container {}: {}", name, e);
                None
            }
        }
    }

    /// Build an image from `context`. Blocks until the build finishes.
    pub async fn build_image(&self, name: &str, context: &Path) -> bool {
        debug!("Building image {} from {}", name, context.display());
        match self.api.build_image(name, context).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to build image {}: {}", name, e);
                false
            }
        }
    }

    /// Create and start a persistent container publishing
    /// `host_port -> container_port/tcp`. Returns the container ID, or `None`
    /// on failure (including a name that is already taken).
    pub async fn run_container(
        &self,
        image: &str,
        name: &str,
        host_port: u16,
        container_port: u16,
    ) -> Option<String> {
        let config = ContainerConfig::new(image)
            .name(name)
            .port(host_port, container_port)
            .label("classbox.container", name)
            .cpus(self.cpu_count)
            .memory_mb(self.memory_limit_mb);
        self.run_with_config(&config).await
    }

    /// Like [`run_container`](Self::run_container) with a fully specified config.
    pub async fn run_with_config(&self, config: &ContainerConfig) -> Option<String> {
        let name = config.name.as_deref().unwrap_or(&config.image);
        match self.api.create_container(config).await {
            Ok(id) => Some(id),
            Err(ContainerError::Conflict(message)) => {
                error!("Container {} already exists: {}", name, message);
                None
            }
            Err(e) => {
                error!("Failed to run container {}: {}", name, e);
                None
            }
        }
    }

    /// Start a previously created, stopped container.
    pub async fn start_existing(&self, name: &str) -> bool {
        match self.api.start_container(name).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to start container {}: {}", name, e);
                false
            }
        }
    }

    pub async fn stop_container(&self, name: &str) -> bool {
        match self
            .api
            .stop_container(name, Some(self.stop_timeout_secs))
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_not_found() => {
                debug!("Container {} does not exist, nothing to stop", name);
                true
            }
            Err(e) => {
                error!("Failed to stop container {}: {}", name, e);
                false
            }
        }
    }

    pub async fn remove_container(&self, name: &str) -> bool {
        match self.api.remove_container(name, true).await {
            Ok(()) => true,
            Err(e) if e.is_not_found() => {
                debug!("Container {} does not exist, nothing to remove", name);
                true
            }
            Err(e) => {
                error!("Failed to remove container {}: {}", name, e);
                false
            }
        }
    }

    /// Open an interactive exec stream. Errors are returned since the caller
    /// expected the action to happen and has to report why it did not.
    pub async fn open_exec(&self, container: &str, spec: &ExecSpec) -> ContainerResult<ExecStream> {
        self.api.open_exec(container, spec).await
    }

    pub async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> ContainerResult<()> {
        self.api.resize_exec(exec_id, rows, cols).await
    }

    pub async fn exec_output(&self, container: &str, command: &[&str]) -> ContainerResult<String> {
        self.api.exec_output(container, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::FakeRuntime;

    fn client(fake: &Arc<FakeRuntime>) -> RuntimeClient {
        RuntimeClient::new(fake.clone(), &RuntimeConfig::default())
    }

    #[tokio::test]
    async fn test_status_collapses_non_running_states() {
        let fake = Arc::new(FakeRuntime::default());
        fake.set_container_status("c-running", "running");
        fake.set_container_status("c-paused", "paused");
        let client = client(&fake);

        assert_eq!(
            client.container_status("c-running").await,
            ContainerStatus::Running
        );
        assert_eq!(
            client.container_status("c-paused").await,
            ContainerStatus::Stopped
        );
        assert_eq!(
            client.container_status("c-missing").await,
            ContainerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_unreachable_runtime_degrades_to_failure_values() {
        let fake = Arc::new(FakeRuntime::default());
        fake.set_unavailable(true);
        let client = client(&fake);

        assert!(!client.is_available().await);
        assert_eq!(client.probe_status("c1").await, None);
        assert!(!client.image_exists("img").await);
        assert!(!client.container_exists("c1").await);
        assert_eq!(client.container_status("c1").await, ContainerStatus::Stopped);
        assert!(!client.build_image("img", Path::new("/tmp")).await);
        assert_eq!(client.run_container("img", "c1", 8080, 80).await, None);
        assert!(!client.start_existing("c1").await);
        assert!(!client.stop_container("c1").await);
        assert!(!client.remove_container("c1").await);
    }

    #[tokio::test]
    async fn test_run_container_applies_ports_and_limits() {
        let fake = Arc::new(FakeRuntime::default());
        let client = client(&fake);

        let id = client.run_container("img", "c1", 8080, 80).await;
        assert!(id.is_some());

        let created = fake.created_configs();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].ports[0].host_port, 8080);
        assert_eq!(created[0].ports[0].container_port, 80);
        assert_eq!(created[0].cpu_count, Some(1.0));
        assert_eq!(created[0].memory_bytes, Some(1024 * 1024 * 1024));
    }

    #[tokio::test]
    async fn test_run_container_never_overwrites_existing() {
        let fake = Arc::new(FakeRuntime::default());
        fake.set_container_status("c1", "exited");
        let client = client(&fake);

        assert_eq!(client.run_container("img", "c1", 8080, 80).await, None);
        assert!(fake.created_configs().is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_remove_missing_container_succeed() {
        let fake = Arc::new(FakeRuntime::default());
        let client = client(&fake);

        assert!(client.stop_container("ghost").await);
        assert!(client.remove_container("ghost").await);
    }
}
