//! Terminal bridge between client connections and container shells.

use classbox_protocol::{TerminalEvent, TerminalSessionInfo};
use dashmap::DashMap;
use futures::StreamExt;
use log::{debug, info, warn};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::TerminalConfig;
use super::error::TerminalError;
use super::session::{
    SessionMetadata, Utf8Decoder, is_valid_marker, new_session_marker, shell_command,
    sweep_command, swept_pids,
};
use crate::container::{ContainerStatus, ExecInput, ExecOutput, ExecSpec, ExecStream, RuntimeClient};
use crate::lifecycle::LifecycleConfig;
use crate::projects::{ProjectDirectory, authorize};
use crate::store::{Namespace, SharedStore, TERMINAL_SESSIONS_NAMESPACE, WorkerRegistry, now_ms};

/// Where session events are delivered, in order.
pub type EventSender = mpsc::Sender<TerminalEvent>;

/// Process-local half of a session. Never leaves this worker.
struct LiveSession {
    marker: String,
    container: String,
    exec_id: String,
    input: Arc<Mutex<ExecInput>>,
    cancel: CancellationToken,
    close_reason: Arc<OnceLock<String>>,
}

struct BridgeInner {
    runtime: RuntimeClient,
    projects: Arc<dyn ProjectDirectory>,
    naming: LifecycleConfig,
    metadata: Namespace,
    workers: Arc<WorkerRegistry>,
    live: DashMap<String, LiveSession>,
    config: TerminalConfig,
}

/// Terminal session bridge. Cheap to clone.
#[derive(Clone)]
pub struct TerminalBridge {
    inner: Arc<BridgeInner>,
}

impl TerminalBridge {
    pub fn new(
        runtime: RuntimeClient,
        projects: Arc<dyn ProjectDirectory>,
        store: &SharedStore,
        workers: Arc<WorkerRegistry>,
        naming: LifecycleConfig,
        config: TerminalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                runtime,
                projects,
                naming,
                metadata: store.namespace(TERMINAL_SESSIONS_NAMESPACE),
                workers,
                live: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.inner.config
    }

    /// Open a shell in the project's container and bind it to `connection_id`.
    ///
    /// A session already bound to the connection is torn down first. On
    /// success `Ready` has been delivered and output events follow.
    pub async fn attach(
        &self,
        connection_id: &str,
        actor: &str,
        project_id: &str,
        events: EventSender,
    ) -> Result<(), TerminalError> {
        let project = authorize(self.inner.projects.as_ref(), actor, project_id).await?;
        let container = self.inner.naming.container_ref(&project.id);

        if self.inner.runtime.container_status(&container).await != ContainerStatus::Running {
            return Err(TerminalError::NotRunning(project.id));
        }

        if self.inner.live.contains_key(connection_id)
            || self.inner.metadata.contains(connection_id).await
        {
            self.teardown(connection_id, None, "replaced by a new session")
                .await;
        }

        let marker = new_session_marker();
        let ExecStream {
            exec_id,
            output,
            input,
        } = self
            .inner
            .runtime
            .open_exec(&container, &self.exec_spec(&marker))
            .await
            .map_err(TerminalError::Exec)?;

        let cancel = CancellationToken::new();
        let close_reason = Arc::new(OnceLock::new());
        // Live handle first, so the janitor never sees metadata it cannot
        // account for.
        self.inner.live.insert(
            connection_id.to_string(),
            LiveSession {
                marker: marker.clone(),
                container: container.clone(),
                exec_id: exec_id.clone(),
                input: Arc::new(Mutex::new(input)),
                cancel: cancel.clone(),
                close_reason: close_reason.clone(),
            },
        );

        let metadata = SessionMetadata {
            connection_id: connection_id.to_string(),
            project_id: project.id.clone(),
            actor: actor.to_string(),
            container: container.clone(),
            exec_id: exec_id.clone(),
            session_marker: marker.clone(),
            worker_id: self.inner.workers.worker_id().to_string(),
            created_at_ms: now_ms(),
        };
        if !self.inner.metadata.set(connection_id, &metadata, None).await {
            warn!(
                "Terminal session {} only recorded locally; other workers cannot see it",
                connection_id
            );
        }

        let ready = TerminalEvent::Ready {
            project_id: project.id.clone(),
        };
        if events.send(ready).await.is_err() {
            self.teardown(connection_id, Some(&marker), "connection closed")
                .await;
            return Err(TerminalError::Stream(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection closed before the session was ready",
            )));
        }

        tokio::spawn(pump_output(
            self.clone(),
            connection_id.to_string(),
            marker,
            output,
            events,
            cancel,
            close_reason,
        ));

        info!(
            "Terminal {} attached to project {} for {} (exec {})",
            connection_id, project.id, actor, exec_id
        );
        Ok(())
    }

    /// Write raw keystrokes to the session's shell.
    pub async fn input(&self, connection_id: &str, data: &[u8]) -> Result<(), TerminalError> {
        let input = self
            .inner
            .live
            .get(connection_id)
            .map(|session| session.input.clone());
        let Some(input) = input else {
            self.reclaim(connection_id).await;
            return Err(TerminalError::NoSession);
        };

        let result = {
            let mut writer = input.lock().await;
            match writer.write_all(data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = result {
            warn!("Terminal {} input failed: {}", connection_id, e);
            self.teardown(connection_id, None, "input stream failed")
                .await;
            return Err(TerminalError::Stream(e));
        }
        Ok(())
    }

    /// Resize the session's pseudo-terminal.
    pub async fn resize(&self, connection_id: &str, rows: u16, cols: u16) -> Result<(), TerminalError> {
        if rows == 0 || cols == 0 {
            return Err(TerminalError::InvalidSize { rows, cols });
        }

        let live_exec = self
            .inner
            .live
            .get(connection_id)
            .map(|session| session.exec_id.clone());
        let Some(live_exec) = live_exec else {
            self.reclaim(connection_id).await;
            return Err(TerminalError::NoSession);
        };
        let exec_id = self
            .inner
            .metadata
            .get::<SessionMetadata>(connection_id)
            .await
            .map(|metadata| metadata.exec_id)
            .unwrap_or(live_exec);

        match self.inner.runtime.resize_exec(&exec_id, rows, cols).await {
            Ok(()) => {
                debug!("Terminal {} resized to {}x{}", connection_id, rows, cols);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!("Terminal {} lost its exec: {}", connection_id, e);
                self.teardown(connection_id, None, "terminal is gone").await;
                Err(TerminalError::ExecGone)
            }
            Err(e) => Err(TerminalError::Resize(e)),
        }
    }

    /// End the connection's session. Returns whether a live session existed.
    pub async fn detach(&self, connection_id: &str, reason: &str) -> bool {
        self.teardown(connection_id, None, reason).await
    }

    /// Sessions of a project across all workers.
    pub async fn sessions_for_project(&self, project_id: &str) -> Vec<TerminalSessionInfo> {
        let mut sessions: Vec<TerminalSessionInfo> = self
            .inner
            .metadata
            .entries::<SessionMetadata>()
            .await
            .into_iter()
            .filter(|(_, metadata)| metadata.project_id == project_id)
            .map(|(_, metadata)| metadata.info())
            .collect();
        sessions.sort_by_key(|info| info.created_at_ms);
        sessions
    }

    /// Number of sessions whose live stream is held by this worker.
    pub fn live_count(&self) -> usize {
        self.inner.live.len()
    }

    /// Sweep sessions nobody can close anymore: those of workers without a
    /// heartbeat and this worker's records without a live stream. Returns how
    /// many were reclaimed.
    pub async fn sweep_orphans(&self) -> usize {
        let own = self.inner.workers.worker_id().to_string();
        let mut reclaimed = 0;

        for (connection_id, metadata) in self.inner.metadata.entries::<SessionMetadata>().await {
            let orphaned = if metadata.worker_id == own {
                !self.inner.live.contains_key(&connection_id)
            } else {
                !self.inner.workers.is_alive(&metadata.worker_id).await
            };
            if !orphaned {
                continue;
            }

            info!(
                "Reclaiming orphaned terminal {} of project {} (worker {})",
                connection_id, metadata.project_id, metadata.worker_id
            );
            self.sweep(&metadata.container, &metadata.session_marker)
                .await;
            // The connection may have been re-registered meanwhile.
            if self.inner.metadata.delete_if(&connection_id, &metadata).await {
                reclaimed += 1;
            }
        }

        reclaimed
    }

    /// Run [`sweep_orphans`](Self::sweep_orphans) every `interval` until
    /// `cancel` fires.
    pub fn spawn_janitor(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = bridge.sweep_orphans().await;
                        if reclaimed > 0 {
                            info!("Reclaimed {} orphaned terminal sessions", reclaimed);
                        }
                    }
                }
            }
            debug!("Terminal janitor stopped");
        })
    }

    /// Tear down every session held by this worker.
    pub async fn shutdown(&self) {
        let connections: Vec<String> = self
            .inner
            .live
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if !connections.is_empty() {
            info!("Closing {} terminal sessions", connections.len());
        }
        for connection_id in connections {
            self.teardown(&connection_id, None, "server shutting down")
                .await;
        }
    }

    fn exec_spec(&self, marker: &str) -> ExecSpec {
        let config = &self.inner.config;
        let mut spec = ExecSpec::new(shell_command(config, marker))
            .env("TERM", config.term.as_str())
            .env("LANG", config.lang.as_str())
            .tty(true);
        if let Some(ref user) = config.user {
            spec = spec.user(user.as_str());
        }
        spec.workdir = config.workdir.clone();
        spec
    }

    /// Metadata for a connection this worker holds no stream for cannot be
    /// closed by anyone else.
    async fn reclaim(&self, connection_id: &str) {
        if self.inner.metadata.contains(connection_id).await {
            self.teardown(connection_id, None, "session lost").await;
        }
    }

    /// Close the live stream, kill the session's processes and drop its
    /// metadata. With `expected_marker`, only that specific session is
    /// touched, so a stale reader cannot tear down its replacement.
    async fn teardown(&self, connection_id: &str, expected_marker: Option<&str>, reason: &str) -> bool {
        let live = match expected_marker {
            Some(marker) => self
                .inner
                .live
                .remove_if(connection_id, |_, session| session.marker == marker),
            None => self.inner.live.remove(connection_id),
        }
        .map(|(_, session)| session);

        if let Some(ref session) = live {
            let _ = session.close_reason.set(reason.to_string());
            session.cancel.cancel();
            let mut input = session.input.lock().await;
            if let Err(e) = input.shutdown().await {
                debug!("Closing input of terminal {}: {}", connection_id, e);
            }
        }

        let marker = expected_marker
            .map(str::to_string)
            .or_else(|| live.as_ref().map(|session| session.marker.clone()));
        let metadata = self
            .inner
            .metadata
            .get::<SessionMetadata>(connection_id)
            .await
            .filter(|metadata| {
                marker
                    .as_ref()
                    .is_none_or(|marker| *marker == metadata.session_marker)
            });

        let target = metadata
            .as_ref()
            .map(|m| (m.container.clone(), m.session_marker.clone()))
            .or_else(|| {
                live.as_ref()
                    .map(|s| (s.container.clone(), s.marker.clone()))
            });
        if let Some((container, marker)) = target {
            self.sweep(&container, &marker).await;
        }
        if metadata.is_some() {
            self.inner.metadata.delete(connection_id).await;
        }

        if live.is_some() {
            info!("Terminal {} closed: {}", connection_id, reason);
        }
        live.is_some()
    }

    /// Kill every process in `container` tagged with `marker`.
    async fn sweep(&self, container: &str, marker: &str) {
        if !is_valid_marker(marker) {
            warn!("Refusing to sweep malformed session marker {:?}", marker);
            return;
        }
        let command = sweep_command(&self.inner.config.marker_env, marker);
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        match self.inner.runtime.exec_output(container, &args).await {
            Ok(output) => {
                let killed = swept_pids(&output).len();
                debug!(
                    "Swept {} processes of session {} in {}",
                    killed, marker, container
                );
            }
            Err(e) if e.is_not_found() => {
                debug!("Container {} is gone, nothing to sweep", container);
            }
            Err(e) => {
                warn!(
                    "Failed to sweep session {} in {}: {}",
                    marker, container, e
                );
            }
        }
    }
}

/// Forward exec output to the connection until the shell exits, the stream
/// fails, or the session is closed. Ends with exactly one `Disconnected`.
async fn pump_output(
    bridge: TerminalBridge,
    connection_id: String,
    marker: String,
    mut output: ExecOutput,
    events: EventSender,
    cancel: CancellationToken,
    close_reason: Arc<OnceLock<String>>,
) {
    let mut decoder = Utf8Decoder::default();
    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break close_reason
                    .get()
                    .cloned()
                    .unwrap_or_else(|| "session closed".to_string());
            }
            chunk = output.next() => match chunk {
                Some(Ok(bytes)) => {
                    let text = decoder.decode(&bytes);
                    if !text.is_empty()
                        && events.send(TerminalEvent::Output { data: text }).await.is_err()
                    {
                        break "connection closed".to_string();
                    }
                }
                Some(Err(e)) => {
                    warn!("Terminal {} stream failed: {}", connection_id, e);
                    let _ = events
                        .send(TerminalEvent::error(format!("terminal stream failed: {}", e)))
                        .await;
                    break "terminal stream failed".to_string();
                }
                None => break "shell exited".to_string(),
            }
        }
    };

    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events.send(TerminalEvent::Output { data: rest }).await;
    }
    let _ = events.send(TerminalEvent::disconnected(reason.as_str())).await;

    // Teardown from elsewhere already cleaned up; otherwise this task does it
    // itself. It never waits on its own handle.
    if !cancel.is_cancelled() {
        bridge
            .teardown(&connection_id, Some(&marker), &reason)
            .await;
    }
}
