//! Per-project container lifecycle.
//!
//! `request_start` flips the project to `starting` and hands the
//! build-and-start sequence to a supervised background task; callers poll
//! `query_status`. The phase lives in the shared store so every worker sees
//! the same state, and the runtime is consulted whenever the record cannot be
//! trusted.

use classbox_protocol::Phase;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use super::models::{
    LifecycleConfig, LifecycleError, PhaseRecord, ProjectRuntime, StartOutcome,
};
use crate::container::{ContainerStatus, RuntimeClient};
use crate::projects::{Project, ProjectDirectory};
use crate::store::{Namespace, PROJECT_PHASE_NAMESPACE, SharedStore, WorkerRegistry};

/// Attempts at claiming the `starting` phase before deferring to whoever
/// keeps changing the record.
const CLAIM_ATTEMPTS: usize = 3;

struct OrchestratorInner {
    runtime: RuntimeClient,
    projects: Arc<dyn ProjectDirectory>,
    phases: Namespace,
    workers: Arc<WorkerRegistry>,
    config: LifecycleConfig,
    tasks: TaskTracker,
}

/// Lifecycle orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl LifecycleOrchestrator {
    pub fn new(
        runtime: RuntimeClient,
        projects: Arc<dyn ProjectDirectory>,
        store: &SharedStore,
        workers: Arc<WorkerRegistry>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                runtime,
                projects,
                phases: store.namespace(PROJECT_PHASE_NAMESPACE),
                workers,
                config,
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    /// Start the project's container without waiting for it.
    ///
    /// Rejects projects without ports before touching the runtime. If a
    /// trusted `starting` record exists, nothing new is launched.
    pub async fn request_start(&self, project: &Project) -> Result<StartOutcome, LifecycleError> {
        let runtime = ProjectRuntime::resolve(&self.inner.config, project)?;
        let worker_id = self.inner.workers.worker_id().to_string();

        for _ in 0..CLAIM_ATTEMPTS {
            let current: Option<PhaseRecord> = self.inner.phases.get(&project.id).await;

            if let Some(ref record) = current
                && record.phase == Phase::Starting
            {
                if !self.is_stale(record).await {
                    debug!(
                        "Project {} is already starting (worker {})",
                        project.id, record.worker_id
                    );
                    return Ok(StartOutcome::AlreadyStarting);
                }
                warn!(
                    "Taking over stale start of project {} from worker {}",
                    project.id, record.worker_id
                );
            }

            let claim = PhaseRecord::new(Phase::Starting, worker_id.as_str());
            if self
                .inner
                .phases
                .compare_and_set(&project.id, current.as_ref(), &claim, None)
                .await
            {
                info!(
                    "Starting project {} (image {}, container {})",
                    project.id, runtime.image_ref, runtime.container_ref
                );
                self.launch(project.clone(), runtime, claim);
                return Ok(StartOutcome::Accepted);
            }
        }

        debug!(
            "Lost the race to start project {}, deferring to the winner",
            project.id
        );
        Ok(StartOutcome::AlreadyStarting)
    }

    /// Current phase of the project.
    ///
    /// A trusted `starting` record is returned as is. Anything else is checked
    /// against the runtime, which wins on disagreement.
    pub async fn query_status(&self, project: &Project) -> Phase {
        let container_ref = self.inner.config.container_ref(&project.id);
        let record: Option<PhaseRecord> = self.inner.phases.get(&project.id).await;

        if let Some(ref record) = record
            && record.phase == Phase::Starting
            && !self.is_stale(record).await
        {
            return Phase::Starting;
        }

        let Some(actual) = self.inner.runtime.probe_status(&container_ref).await else {
            // Runtime unreachable: keep whatever settled phase we know.
            return match record {
                Some(record) if record.phase != Phase::Starting => record.phase,
                _ => Phase::Stopped,
            };
        };

        let actual = match actual {
            ContainerStatus::Running => Phase::Running,
            ContainerStatus::Stopped => Phase::Stopped,
        };

        if let Some(record) = record
            && record.phase != actual
        {
            let corrected = PhaseRecord::new(actual, self.inner.workers.worker_id());
            if self
                .inner
                .phases
                .compare_and_set(&project.id, Some(&record), &corrected, None)
                .await
            {
                info!(
                    "Reconciled project {} from {} to {}",
                    project.id, record.phase, actual
                );
            }
        }

        actual
    }

    /// Stop the project's container. Refused while a start is in flight.
    pub async fn request_stop(&self, project: &Project) -> Result<Phase, LifecycleError> {
        self.ensure_not_starting(project).await?;
        let container_ref = self.inner.config.container_ref(&project.id);

        if !self.inner.runtime.stop_container(&container_ref).await {
            return Err(LifecycleError::RuntimeFailure(format!(
                "could not stop container {}",
                container_ref
            )));
        }

        let record = PhaseRecord::new(Phase::Stopped, self.inner.workers.worker_id());
        self.inner.phases.set(&project.id, &record, None).await;
        info!("Stopped project {}", project.id);
        Ok(Phase::Stopped)
    }

    /// Stop and remove the project's container and forget its phase. The next
    /// start creates a fresh container, picking up changed ports.
    pub async fn reset(&self, project: &Project) -> Result<Phase, LifecycleError> {
        self.ensure_not_starting(project).await?;
        let container_ref = self.inner.config.container_ref(&project.id);

        if !self.inner.runtime.stop_container(&container_ref).await
            || !self.inner.runtime.remove_container(&container_ref).await
        {
            return Err(LifecycleError::RuntimeFailure(format!(
                "could not remove container {}",
                container_ref
            )));
        }

        self.inner.phases.delete(&project.id).await;
        info!("Reset project {}", project.id);
        Ok(Phase::Stopped)
    }

    /// Stop accepting sequences and wait (bounded) for in-flight ones.
    pub async fn shutdown(&self) {
        self.inner.tasks.close();
        let grace = Duration::from_secs(self.inner.config.shutdown_grace_secs);
        if tokio::time::timeout(grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "{} start sequences still running at shutdown",
                self.inner.tasks.len()
            );
        }
    }

    async fn ensure_not_starting(&self, project: &Project) -> Result<(), LifecycleError> {
        let record: Option<PhaseRecord> = self.inner.phases.get(&project.id).await;
        if let Some(ref record) = record
            && record.phase == Phase::Starting
            && !self.is_stale(record).await
        {
            return Err(LifecycleError::StartInProgress(project.id.clone()));
        }
        Ok(())
    }

    /// A `starting` record is stale when its worker is gone or it has been
    /// starting for longer than any sequence may run.
    async fn is_stale(&self, record: &PhaseRecord) -> bool {
        let limit_ms = i64::try_from(self.inner.config.starting_stale_after_secs)
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000);
        record.age_ms() > limit_ms || !self.inner.workers.is_alive(&record.worker_id).await
    }

    /// Run the sequence under a supervisor that always settles the phase.
    fn launch(&self, project: Project, runtime: ProjectRuntime, claim: PhaseRecord) {
        let orchestrator = self.clone();
        let timeout = Duration::from_secs(self.inner.config.start_timeout_secs);

        self.inner.tasks.spawn(async move {
            let project_id = project.id.clone();
            let sequence = {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move { orchestrator.run_start_sequence(&project, &runtime).await })
            };
            let abort = sequence.abort_handle();

            let phase = match tokio::time::timeout(timeout, sequence).await {
                Ok(Ok(phase)) => phase,
                Ok(Err(e)) => {
                    error!("Start sequence for project {} died: {}", project_id, e);
                    Phase::Stopped
                }
                Err(_) => {
                    abort.abort();
                    error!(
                        "Start sequence for project {} timed out after {:?}",
                        project_id, timeout
                    );
                    Phase::Stopped
                }
            };

            orchestrator.settle(&project_id, &claim, phase).await;
        });
    }

    /// Replace our `starting` claim with the final phase, unless someone else
    /// has taken the record over in the meantime.
    async fn settle(&self, project_id: &str, claim: &PhaseRecord, phase: Phase) {
        let record = PhaseRecord::new(phase, claim.worker_id.as_str());
        if self
            .inner
            .phases
            .compare_and_set(project_id, Some(claim), &record, None)
            .await
        {
            info!("Project {} is now {}", project_id, phase);
        } else {
            warn!(
                "Phase record of project {} changed while starting; not overwriting with {}",
                project_id, phase
            );
        }
    }

    /// Build the image if missing, then start or create the container.
    async fn run_start_sequence(&self, project: &Project, runtime: &ProjectRuntime) -> Phase {
        let client = &self.inner.runtime;

        if !client.image_exists(&runtime.image_ref).await {
            let context = self.inner.config.build_context_for(&project.id);
            info!(
                "Building image {} for project {} from {}",
                runtime.image_ref,
                project.id,
                context.display()
            );
            if !client.build_image(&runtime.image_ref, &context).await {
                warn!("Build failed for project {}", project.id);
                return Phase::Stopped;
            }
        }

        if client.container_exists(&runtime.container_ref).await {
            if !client.start_existing(&runtime.container_ref).await {
                return Phase::Stopped;
            }
        } else {
            let Some(container_id) = client
                .run_container(
                    &runtime.image_ref,
                    &runtime.container_ref,
                    runtime.host_port,
                    runtime.container_port,
                )
                .await
            else {
                return Phase::Stopped;
            };

            if let Err(e) = self
                .inner
                .projects
                .set_container_id(&project.id, &container_id)
                .await
            {
                warn!(
                    "Could not record container {} for project {}: {:#}",
                    container_id, project.id, e
                );
            }
        }

        Phase::Running
    }
}
