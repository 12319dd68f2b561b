//! Shared harness for the HTTP and terminal integration tests.

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;

use classbox::api::{AppState, create_router};
use classbox::auth::{AuthConfig, AuthState, DevUser};
use classbox::container::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, ExecSpec, ExecStream,
    RuntimeClient, RuntimeConfig,
};
use classbox::db::Database;
use classbox::lifecycle::{LifecycleConfig, LifecycleOrchestrator};
use classbox::projects::{NewProject, ProjectDirectory, ProjectRepository};
use classbox::store::{SharedStore, SqliteStateBackend, WorkerRegistry};
use classbox::terminal::{TerminalBridge, TerminalConfig};

/// Runtime whose exec'd shells echo their input back.
#[derive(Default)]
pub struct EchoRuntime {
    images: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, String>>,
    build_gate: Mutex<Option<Arc<Notify>>>,
    exec_seq: AtomicUsize,
    pub sweeps: AtomicUsize,
}

impl EchoRuntime {
    pub fn set_container_status(&self, name: &str, status: &str) {
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), status.to_string());
    }

    pub fn container_status(&self, name: &str) -> Option<String> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    /// Make builds wait until the returned notify is signalled.
    pub fn hold_builds(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.build_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ContainerRuntimeApi for EchoRuntime {
    async fn ping(&self) -> ContainerResult<()> {
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        Ok(self.container_status(id_or_name))
    }

    async fn build_image(&self, image: &str, _context: &Path) -> ContainerResult<()> {
        let gate = self.build_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.images.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let name = config.name.clone().unwrap_or_default();
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&name) {
            return Err(ContainerError::Conflict(format!("name {} in use", name)));
        }
        containers.insert(name.clone(), "running".to_string());
        Ok(format!("id-{}", name))
    }

    async fn start_container(&self, id_or_name: &str) -> ContainerResult<()> {
        match self.containers.lock().unwrap().get_mut(id_or_name) {
            Some(status) => {
                *status = "running".to_string();
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(id_or_name.to_string())),
        }
    }

    async fn stop_container(
        &self,
        id_or_name: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        match self.containers.lock().unwrap().get_mut(id_or_name) {
            Some(status) => {
                *status = "exited".to_string();
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(id_or_name.to_string())),
        }
    }

    async fn remove_container(&self, id_or_name: &str, _force: bool) -> ContainerResult<()> {
        match self.containers.lock().unwrap().remove(id_or_name) {
            Some(_) => Ok(()),
            None => Err(ContainerError::ContainerNotFound(id_or_name.to_string())),
        }
    }

    async fn open_exec(&self, container: &str, _spec: &ExecSpec) -> ContainerResult<ExecStream> {
        if self.container_status(container).as_deref() != Some("running") {
            return Err(ContainerError::Conflict(format!(
                "container {} is not running",
                container
            )));
        }

        let exec_id = format!("exec-{}", self.exec_seq.fetch_add(1, Ordering::SeqCst));
        let (local, mut remote) = tokio::io::duplex(4096);
        let (mut tx, rx) = mpsc::channel::<ContainerResult<Bytes>>(64);

        // Loopback shell: everything written to stdin comes back as output,
        // and closing stdin ends the process.
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match remote.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(ExecStream {
            exec_id,
            output: rx.boxed(),
            input: Box::pin(local),
        })
    }

    async fn resize_exec(&self, _exec_id: &str, _rows: u16, _cols: u16) -> ContainerResult<()> {
        Ok(())
    }

    async fn exec_output(&self, _container: &str, _command: &[&str]) -> ContainerResult<String> {
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        Ok(String::new())
    }
}

pub struct TestApp {
    pub router: Router,
    pub runtime: Arc<EchoRuntime>,
    pub repo: ProjectRepository,
    pub state: AppState,
}

fn dev_user(id: &str, name: &str) -> DevUser {
    DevUser {
        id: id.to_string(),
        name: name.to_string(),
        email: None,
    }
}

/// Router in dev auth mode over an in-memory database.
///
/// - `p1`: ports 18080 -> 80, members alice and bob
/// - `p2`: no ports, member alice
/// - carol is a known user without projects
pub async fn test_app() -> TestApp {
    let db = Database::in_memory().await.unwrap();
    let repo = ProjectRepository::new(db.pool().clone());

    repo.upsert(&NewProject {
        id: "p1".to_string(),
        name: "Project One".to_string(),
        host_port: Some(18080),
        container_port: Some(80),
    })
    .await
    .unwrap();
    repo.upsert(&NewProject {
        id: "p2".to_string(),
        name: "Project Two".to_string(),
        host_port: None,
        container_port: None,
    })
    .await
    .unwrap();
    repo.add_member("p1", "alice").await.unwrap();
    repo.add_member("p1", "bob").await.unwrap();
    repo.add_member("p2", "alice").await.unwrap();

    let store = SharedStore::new(Arc::new(SqliteStateBackend::new(db.pool().clone())));
    let workers = Arc::new(WorkerRegistry::with_id(
        &store,
        "worker-test",
        Duration::from_secs(30),
    ));
    workers.heartbeat().await;

    let runtime = Arc::new(EchoRuntime::default());
    let client = RuntimeClient::new(runtime.clone(), &RuntimeConfig::default());
    let projects: Arc<dyn ProjectDirectory> = Arc::new(repo.clone());
    let lifecycle = LifecycleOrchestrator::new(
        client.clone(),
        projects.clone(),
        &store,
        workers.clone(),
        LifecycleConfig::default(),
    );
    let terminals = TerminalBridge::new(
        client,
        projects.clone(),
        &store,
        workers,
        LifecycleConfig::default(),
        TerminalConfig::default(),
    );

    let auth = AuthState::new(AuthConfig {
        dev_mode: true,
        jwt_secret: None,
        dev_users: vec![
            dev_user("alice", "Alice"),
            dev_user("bob", "Bob"),
            dev_user("carol", "Carol"),
        ],
        allowed_origins: Vec::new(),
    });

    let state = AppState::new(projects, lifecycle, terminals, auth, store.is_shared());
    let router = create_router(state.clone());

    TestApp {
        router,
        runtime,
        repo,
        state,
    }
}
