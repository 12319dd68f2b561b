//! In-memory runtime used by unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::DuplexStream;
use tokio::sync::Notify;

use super::container::{ContainerConfig, ExecSpec};
use super::error::{ContainerError, ContainerResult};
use super::{ContainerRuntimeApi, ExecStream};

struct FakeExec {
    container: String,
    spec: ExecSpec,
    output: Option<UnboundedSender<ContainerResult<Bytes>>>,
    input: Option<DuplexStream>,
    resizes: Vec<(u16, u16)>,
    killed: bool,
}

impl FakeExec {
    /// `KEY=value` assignments exported by the exec's shell script.
    fn exported(&self) -> Vec<String> {
        self.spec
            .cmd
            .join(" ")
            .split(|c: char| c.is_whitespace() || c == ';')
            .filter(|token| token.contains('='))
            .map(|token| token.to_string())
            .collect()
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    images: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, String>>,
    created: Mutex<Vec<ContainerConfig>>,
    execs: Mutex<HashMap<String, FakeExec>>,
    sweeps: Mutex<Vec<String>>,
    build_gate: Mutex<Option<Arc<Notify>>>,
    sweep_gate: Mutex<Option<Arc<Notify>>>,
    unavailable: AtomicBool,
    build_fails: AtomicBool,
    build_panics: AtomicBool,
    exec_seq: AtomicUsize,
    pub build_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
}

impl FakeRuntime {
    pub fn set_unavailable(&self, value: bool) {
        self.unavailable.store(value, Ordering::SeqCst);
    }

    pub fn set_build_fails(&self, value: bool) {
        self.build_fails.store(value, Ordering::SeqCst);
    }

    pub fn set_build_panics(&self, value: bool) {
        self.build_panics.store(value, Ordering::SeqCst);
    }

    /// Make builds wait until the returned notify is signalled.
    pub fn hold_builds(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.build_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Make `exec_output` wait until the returned notify is signalled. The
    /// command is recorded before waiting.
    pub fn hold_sweeps(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.sweep_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn add_image(&self, image: &str) {
        self.images.lock().unwrap().insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.lock().unwrap().contains(image)
    }

    pub fn set_container_status(&self, name: &str, status: &str) {
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), status.to_string());
    }

    pub fn container_status(&self, name: &str) -> Option<String> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    pub fn created_configs(&self) -> Vec<ContainerConfig> {
        self.created.lock().unwrap().clone()
    }

    pub fn exec_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.execs.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn exec_spec(&self, exec_id: &str) -> Option<ExecSpec> {
        self.execs
            .lock()
            .unwrap()
            .get(exec_id)
            .map(|exec| exec.spec.clone())
    }

    pub fn exec_container(&self, exec_id: &str) -> Option<String> {
        self.execs
            .lock()
            .unwrap()
            .get(exec_id)
            .map(|exec| exec.container.clone())
    }

    pub fn push_output(&self, exec_id: &str, data: &[u8]) {
        if let Some(exec) = self.execs.lock().unwrap().get(exec_id)
            && let Some(ref tx) = exec.output
        {
            let _ = tx.unbounded_send(Ok(Bytes::copy_from_slice(data)));
        }
    }

    pub fn fail_output(&self, exec_id: &str, message: &str) {
        if let Some(exec) = self.execs.lock().unwrap().get(exec_id)
            && let Some(ref tx) = exec.output
        {
            let _ = tx.unbounded_send(Err(ContainerError::Io(std::io::Error::other(
                message.to_string(),
            ))));
        }
    }

    /// Simulate the remote process exiting.
    pub fn close_output(&self, exec_id: &str) {
        if let Some(exec) = self.execs.lock().unwrap().get_mut(exec_id) {
            exec.output = None;
        }
    }

    /// Remote end of the exec's stdin.
    pub fn take_input(&self, exec_id: &str) -> Option<DuplexStream> {
        self.execs
            .lock()
            .unwrap()
            .get_mut(exec_id)
            .and_then(|exec| exec.input.take())
    }

    pub fn resizes(&self, exec_id: &str) -> Vec<(u16, u16)> {
        self.execs
            .lock()
            .unwrap()
            .get(exec_id)
            .map(|exec| exec.resizes.clone())
            .unwrap_or_default()
    }

    pub fn is_killed(&self, exec_id: &str) -> bool {
        self.execs
            .lock()
            .unwrap()
            .get(exec_id)
            .map(|exec| exec.killed)
            .unwrap_or(false)
    }

    pub fn sweep_commands(&self) -> Vec<String> {
        self.sweeps.lock().unwrap().clone()
    }

    fn check_available(&self) -> ContainerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ContainerError::Unavailable("fake runtime is down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn ping(&self) -> ContainerResult<()> {
        self.check_available()
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        self.check_available()?;
        Ok(self.has_image(image))
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        self.check_available()?;
        Ok(self.container_status(id_or_name))
    }

    async fn build_image(&self, image: &str, _context: &Path) -> ContainerResult<()> {
        self.check_available()?;
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.build_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.build_panics.load(Ordering::SeqCst) {
            panic!("build exploded");
        }
        if self.build_fails.load(Ordering::SeqCst) {
            return Err(ContainerError::BuildFailed {
                image: image.to_string(),
                message: "step 3/7 failed".to_string(),
            });
        }
        self.add_image(image);
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.check_available()?;
        config.validate()?;
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let name = config.name.clone().unwrap_or_default();
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&name) {
            return Err(ContainerError::Conflict(format!("name {} in use", name)));
        }
        containers.insert(name.clone(), "running".to_string());
        self.created.lock().unwrap().push(config.clone());
        Ok(format!("id-{}", name))
    }

    async fn start_container(&self, id_or_name: &str) -> ContainerResult<()> {
        self.check_available()?;
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(id_or_name) {
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
        self.check_available()?;
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(id_or_name) {
            Some(status) => {
                *status = "exited".to_string();
                Ok(())
            }
            None => Err(ContainerError::ContainerNotFound(id_or_name.to_string())),
        }
    }

    async fn remove_container(&self, id_or_name: &str, _force: bool) -> ContainerResult<()> {
        self.check_available()?;
        match self.containers.lock().unwrap().remove(id_or_name) {
            Some(_) => Ok(()),
            None => Err(ContainerError::ContainerNotFound(id_or_name.to_string())),
        }
    }

    async fn open_exec(&self, container: &str, spec: &ExecSpec) -> ContainerResult<ExecStream> {
        self.check_available()?;
        spec.validate()?;
        if self.container_status(container).as_deref() != Some("running") {
            return Err(ContainerError::Conflict(format!(
                "container {} is not running",
                container
            )));
        }

        let exec_id = format!("exec-{}", self.exec_seq.fetch_add(1, Ordering::SeqCst));
        let (output_tx, output_rx) = unbounded();
        let (local, remote) = tokio::io::duplex(4096);

        self.execs.lock().unwrap().insert(
            exec_id.clone(),
            FakeExec {
                container: container.to_string(),
                spec: spec.clone(),
                output: Some(output_tx),
                input: Some(remote),
                resizes: Vec::new(),
                killed: false,
            },
        );

        Ok(ExecStream {
            exec_id,
            output: output_rx.boxed(),
            input: Box::pin(local),
        })
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> ContainerResult<()> {
        self.check_available()?;
        match self.execs.lock().unwrap().get_mut(exec_id) {
            Some(exec) => {
                exec.resizes.push((rows, cols));
                Ok(())
            }
            None => Err(ContainerError::ExecNotFound(exec_id.to_string())),
        }
    }

    async fn exec_output(&self, container: &str, command: &[&str]) -> ContainerResult<String> {
        self.check_available()?;
        if self.container_status(container).is_none() {
            return Err(ContainerError::ContainerNotFound(container.to_string()));
        }
        let script = command.join(" ");
        self.sweeps.lock().unwrap().push(script.clone());
        let gate = self.sweep_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut killed = Vec::new();
        for (id, exec) in self.execs.lock().unwrap().iter_mut() {
            if exec.killed || exec.container != container {
                continue;
            }
            if exec.exported().iter().any(|kv| script.contains(kv.as_str())) {
                exec.killed = true;
                exec.output = None;
                killed.push(id.clone());
            }
        }
        Ok(killed.join("\n"))
    }
}
