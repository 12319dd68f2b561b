//! Docker Engine API runtime.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;

use super::container::{ContainerConfig, ExecSpec, validate_container_name, validate_image_name};
use super::error::{ContainerError, ContainerResult};
use super::{ContainerRuntimeApi, ExecStream, RuntimeConfig};

/// Number of trailing build output lines kept for error reports.
const BUILD_ERROR_TAIL: usize = 20;

/// What a failing API call was about, for not-found mapping.
#[derive(Clone, Copy)]
enum Target<'a> {
    Image(&'a str),
    Container(&'a str),
    Exec(&'a str),
}

/// Runtime client speaking the Docker Engine API through `bollard`.
///
/// The connection is created lazily so that an unreachable daemon at startup
/// does not prevent the service from coming up.
#[derive(Clone)]
pub struct DockerRuntime {
    config: RuntimeConfig,
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            docker: Arc::new(RwLock::new(None)),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get or create the API connection.
    async fn docker(&self) -> ContainerResult<Docker> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = self.connect()?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    fn connect(&self) -> ContainerResult<Docker> {
        let timeout = self.config.api_timeout_secs;
        let result = match self.config.docker_host.as_deref() {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, timeout, bollard::API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, timeout, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        };
        result.map_err(|e| ContainerError::Unavailable(e.to_string()))
    }
}

/// Map a bollard error onto the runtime error taxonomy.
fn map_error(command: &str, target: Target<'_>, err: BollardError) -> ContainerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => match target {
            Target::Image(name) => ContainerError::ImageNotFound(name.to_string()),
            Target::Container(name) => ContainerError::ContainerNotFound(name.to_string()),
            Target::Exec(id) => ContainerError::ExecNotFound(id.to_string()),
        },
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => ContainerError::Conflict(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => ContainerError::CommandFailed {
            command: command.to_string(),
            message: format!("{} (status {})", message, status_code),
        },
        BollardError::IOError { err } => ContainerError::Unavailable(err.to_string()),
        BollardError::RequestTimeoutError => {
            ContainerError::Unavailable(format!("{} timed out", command))
        }
        BollardError::SocketNotFoundError(path) => {
            ContainerError::Unavailable(format!("socket not found: {}", path))
        }
        other => {
            let message = other.to_string();
            if message.contains("connect") || message.contains("Connection refused") {
                ContainerError::Unavailable(message)
            } else {
                ContainerError::CommandFailed {
                    command: command.to_string(),
                    message,
                }
            }
        }
    }
}

/// 304 Not Modified: the container is already in the requested state.
fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntimeApi for DockerRuntime {
    async fn ping(&self) -> ContainerResult<()> {
        let docker = self.docker().await?;
        docker
            .ping()
            .await
            .map_err(|e| ContainerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        let docker = self.docker().await?;
        match docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => match map_error("image inspect", Target::Image(image), e) {
                ContainerError::ImageNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        validate_container_name(id_or_name)?;
        let docker = self.docker().await?;
        match docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let status = info
                    .state
                    .and_then(|state| state.status)
                    .map(|status| status.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Ok(Some(status))
            }
            Err(e) => match map_error("inspect", Target::Container(id_or_name), e) {
                ContainerError::ContainerNotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn build_image(&self, image: &str, context: &Path) -> ContainerResult<()> {
        validate_image_name(image)?;
        if !context.is_dir() {
            return Err(ContainerError::InvalidInput(format!(
                "build context is not a directory: {}",
                context.display()
            )));
        }

        let mut command = Command::new(self.config.binary());
        command
            .args(["build", "--rm", "--force-rm", "-t", image])
            .arg(context)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref host) = self.config.docker_host {
            command.env("DOCKER_HOST", host);
        }

        let mut child = command.spawn().map_err(|e| ContainerError::CommandFailed {
            command: "build".to_string(),
            message: e.to_string(),
        })?;

        let stdout_task = child.stdout.take().map(|stdout| {
            let image = image.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[build {}] {}", image, line);
                }
            })
        });

        let mut tail: VecDeque<String> = VecDeque::with_capacity(BUILD_ERROR_TAIL);
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[build {}] {}", image, line);
                if tail.len() == BUILD_ERROR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stdout_task {
            let _ = task.await;
        }

        if !status.success() {
            return Err(ContainerError::BuildFailed {
                image: image.to_string(),
                message: if tail.is_empty() {
                    status.to_string()
                } else {
                    tail.into_iter().collect::<Vec<_>>().join("\n")
                },
            });
        }

        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let docker = self.docker().await?;

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &config.ports {
            exposed_ports.insert(port.container_key(), HashMap::new());
            port_bindings.insert(
                port.container_key(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            nano_cpus: config.cpu_count.map(|cpus| (cpus * 1_000_000_000.0) as i64),
            memory: config.memory_bytes,
            auto_remove: Some(false),
            ..Default::default()
        };

        let mut env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let container_config = Config {
            image: Some(config.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            labels: Some(config.labels.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let name = config.name.clone().unwrap_or_default();
        let target = Target::Container(&name);
        let options = config.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        });

        let response = docker
            .create_container(options, container_config)
            .await
            .map_err(|e| map_error("create", target, e))?;

        docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error("start", target, e))?;

        Ok(response.id)
    }

    async fn start_container(&self, id_or_name: &str) -> ContainerResult<()> {
        validate_container_name(id_or_name)?;
        let docker = self.docker().await?;
        match docker
            .start_container(id_or_name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_error("start", Target::Container(id_or_name), e)),
        }
    }

    async fn stop_container(
        &self,
        id_or_name: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_name(id_or_name)?;
        let docker = self.docker().await?;
        let options = timeout_seconds.map(|t| StopContainerOptions { t: i64::from(t) });
        match docker.stop_container(id_or_name, options).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(map_error("stop", Target::Container(id_or_name), e)),
        }
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(id_or_name)?;
        let docker = self.docker().await?;
        docker
            .remove_container(
                id_or_name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_error("rm", Target::Container(id_or_name), e))
    }

    async fn open_exec(&self, container: &str, spec: &ExecSpec) -> ContainerResult<ExecStream> {
        validate_container_name(container)?;
        spec.validate()?;
        let docker = self.docker().await?;

        let exec = docker
            .create_exec(
                container,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(spec.tty),
                    env: Some(spec.env_pairs()),
                    cmd: Some(spec.cmd.clone()),
                    user: spec.user.clone(),
                    working_dir: spec.workdir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_error("exec", Target::Container(container), e))?;

        let started = docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: spec.tty,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| map_error("exec start", Target::Exec(&exec.id), e))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map(|chunk| {
                        chunk.map(LogOutput::into_bytes).map_err(|e| {
                            ContainerError::Io(std::io::Error::other(e.to_string()))
                        })
                    })
                    .boxed();
                Ok(ExecStream {
                    exec_id: exec.id,
                    output,
                    input,
                })
            }
            StartExecResults::Detached => Err(ContainerError::CommandFailed {
                command: "exec start".to_string(),
                message: "exec started detached, no stream to attach".to_string(),
            }),
        }
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> ContainerResult<()> {
        let docker = self.docker().await?;
        docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| map_error("exec resize", Target::Exec(exec_id), e))
    }

    async fn exec_output(&self, container: &str, command: &[&str]) -> ContainerResult<String> {
        validate_container_name(container)?;
        let docker = self.docker().await?;

        let exec = docker
            .create_exec(
                container,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(false),
                    cmd: Some(command.iter().map(|s| s.to_string()).collect()),
                    user: Some("root".to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_error("exec", Target::Container(container), e))?;

        let started = docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| map_error("exec start", Target::Exec(&exec.id), e))?;

        let mut collected = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                let chunk = chunk.map_err(|e| map_error("exec read", Target::Exec(&exec.id), e))?;
                collected.extend_from_slice(&chunk.into_bytes());
            }
        }

        Ok(String::from_utf8_lossy(&collected).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_error_not_found_by_target() {
        let err = || BollardError::DockerResponseServerError {
            status_code: 404,
            message: "no such object".to_string(),
        };
        assert!(matches!(
            map_error("inspect", Target::Container("c1"), err()),
            ContainerError::ContainerNotFound(name) if name == "c1"
        ));
        assert!(matches!(
            map_error("image inspect", Target::Image("img"), err()),
            ContainerError::ImageNotFound(_)
        ));
        assert!(matches!(
            map_error("exec resize", Target::Exec("e1"), err()),
            ContainerError::ExecNotFound(_)
        ));
    }

    #[test]
    fn test_map_error_conflict_and_server_errors() {
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        };
        assert!(matches!(
            map_error("create", Target::Container("c1"), conflict),
            ContainerError::Conflict(_)
        ));

        let server = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(matches!(
            map_error("create", Target::Container("c1"), server),
            ContainerError::CommandFailed { .. }
        ));
    }

    #[test]
    fn test_map_error_unreachable() {
        let err = BollardError::SocketNotFoundError("/var/run/docker.sock".to_string());
        assert!(map_error("ping", Target::Container("c"), err).is_unavailable());
        assert!(map_error("ping", Target::Container("c"), BollardError::RequestTimeoutError)
            .is_unavailable());
    }

    #[tokio::test]
    async fn test_build_rejects_missing_context() {
        let runtime = DockerRuntime::new(RuntimeConfig::default());
        let result = runtime
            .build_image("classbox-p1", Path::new("/nonexistent/classbox/context"))
            .await;
        assert!(matches!(result, Err(ContainerError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected_before_connecting() {
        let runtime = DockerRuntime::new(RuntimeConfig {
            docker_host: Some("tcp://127.0.0.1:1".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            runtime.container_state_status("bad;name").await,
            Err(ContainerError::InvalidInput(_))
        ));
        assert!(matches!(
            runtime.image_exists("bad image").await,
            Err(ContainerError::InvalidInput(_))
        ));
    }
}
