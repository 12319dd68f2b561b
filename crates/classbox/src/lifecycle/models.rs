//! Lifecycle data models.

use classbox_protocol::{Phase, StartResponse};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::container::{
    ContainerError, ContainerResult, validate_container_name, validate_image_name,
};
use crate::store::now_ms;

/// Lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Prefix of per-project image names.
    pub image_prefix: String,
    /// Prefix of per-project container names.
    pub container_prefix: String,
    /// Build context directory; `{project_id}` is replaced by the project id.
    pub build_context: String,
    /// Upper bound for one build-and-start sequence, in seconds.
    pub start_timeout_secs: u64,
    /// Age after which a `starting` record is no longer trusted, in seconds.
    pub starting_stale_after_secs: u64,
    /// How long shutdown waits for in-flight sequences, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            image_prefix: "classbox-project-".to_string(),
            container_prefix: "classbox-".to_string(),
            build_context: "/var/lib/classbox/projects/{project_id}".to_string(),
            start_timeout_secs: 900,
            starting_stale_after_secs: 960,
            shutdown_grace_secs: 10,
        }
    }
}

impl LifecycleConfig {
    /// Image name for a project. Image repositories must be lowercase.
    pub fn image_ref(&self, project_id: &str) -> String {
        format!("{}{}", self.image_prefix, project_id).to_lowercase()
    }

    pub fn container_ref(&self, project_id: &str) -> String {
        format!("{}{}", self.container_prefix, project_id)
    }

    pub fn build_context_for(&self, project_id: &str) -> PathBuf {
        PathBuf::from(self.build_context.replace("{project_id}", project_id))
    }

    /// A `starting` record must outlive the longest sequence, otherwise a
    /// second start takes over one that is still running.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image_ref("p"))?;
        validate_container_name(&self.container_ref("p"))?;
        if self.start_timeout_secs == 0 {
            return Err(ContainerError::InvalidInput(
                "start_timeout_secs must be positive".to_string(),
            ));
        }
        if self.starting_stale_after_secs <= self.start_timeout_secs {
            return Err(ContainerError::InvalidInput(format!(
                "starting_stale_after_secs ({}) must exceed start_timeout_secs ({})",
                self.starting_stale_after_secs, self.start_timeout_secs
            )));
        }
        Ok(())
    }
}

/// What the store holds per project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    /// Worker that wrote the record.
    pub worker_id: String,
    pub updated_at_ms: i64,
}

impl PhaseRecord {
    pub fn new(phase: Phase, worker_id: impl Into<String>) -> Self {
        Self {
            phase,
            worker_id: worker_id.into(),
            updated_at_ms: now_ms(),
        }
    }

    pub fn age_ms(&self) -> i64 {
        now_ms().saturating_sub(self.updated_at_ms)
    }
}

/// Runtime view of a project: deterministic names plus ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRuntime {
    pub project_id: String,
    pub image_ref: String,
    pub container_ref: String,
    pub host_port: u16,
    pub container_port: u16,
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// This request launched a new build-and-start sequence.
    Accepted,
    /// A sequence was already in flight; nothing new was launched.
    AlreadyStarting,
}

impl StartOutcome {
    /// Both outcomes look the same to callers.
    pub fn response(&self) -> StartResponse {
        StartResponse::starting()
    }
}

/// Lifecycle errors surfaced synchronously to callers.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("project {0} has no host and container port assigned")]
    PortsNotConfigured(String),

    #[error("invalid project {project_id}: {message}")]
    InvalidProject { project_id: String, message: String },

    #[error("project {0} is starting")]
    StartInProgress(String),

    #[error("container runtime failed: {0}")]
    RuntimeFailure(String),
}

impl ProjectRuntime {
    /// Resolve names and ports, failing fast before any runtime call.
    pub fn resolve(
        config: &LifecycleConfig,
        project: &crate::projects::Project,
    ) -> Result<Self, LifecycleError> {
        let (host_port, container_port) = project
            .ports()
            .ok_or_else(|| LifecycleError::PortsNotConfigured(project.id.clone()))?;

        // Image names are lowercase, so ids differing only in case would share one.
        if project.id.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(LifecycleError::InvalidProject {
                project_id: project.id.clone(),
                message: "project ids must be lowercase".to_string(),
            });
        }

        let image_ref = config.image_ref(&project.id);
        let container_ref = config.container_ref(&project.id);
        validate_image_name(&image_ref)
            .and_then(|_| validate_container_name(&container_ref))
            .map_err(|e| LifecycleError::InvalidProject {
                project_id: project.id.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            project_id: project.id.clone(),
            image_ref,
            container_ref,
            host_port,
            container_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projects::Project;

    fn project(id: &str, host: Option<i64>, container: Option<i64>) -> Project {
        Project {
            id: id.to_string(),
            name: "Demo".to_string(),
            host_port: host,
            container_port: container,
            container_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_names_are_deterministic() {
        let config = LifecycleConfig::default();
        let p = project("3f2a-b1", Some(8080), Some(80));
        let a = ProjectRuntime::resolve(&config, &p).unwrap();
        let b = ProjectRuntime::resolve(&config, &p).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.image_ref, "classbox-project-3f2a-b1");
        assert_eq!(a.container_ref, "classbox-3f2a-b1");
    }

    #[test]
    fn test_resolve_rejects_mixed_case_ids() {
        let config = LifecycleConfig::default();
        let result = ProjectRuntime::resolve(&config, &project("3F2A-b1", Some(8080), Some(80)));
        assert!(matches!(result, Err(LifecycleError::InvalidProject { .. })));
    }

    #[test]
    fn test_config_validation() {
        assert!(LifecycleConfig::default().validate().is_ok());

        let short_stale_window = LifecycleConfig {
            start_timeout_secs: 900,
            starting_stale_after_secs: 0,
            ..Default::default()
        };
        assert!(short_stale_window.validate().is_err());

        let equal_windows = LifecycleConfig {
            start_timeout_secs: 60,
            starting_stale_after_secs: 60,
            ..Default::default()
        };
        assert!(equal_windows.validate().is_err());

        let no_timeout = LifecycleConfig {
            start_timeout_secs: 0,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());

        let bad_prefix = LifecycleConfig {
            container_prefix: "bad;prefix-".to_string(),
            ..Default::default()
        };
        assert!(bad_prefix.validate().is_err());
    }

    #[test]
    fn test_resolve_requires_ports() {
        let config = LifecycleConfig::default();
        let result = ProjectRuntime::resolve(&config, &project("p1", Some(8080), None));
        assert!(matches!(result, Err(LifecycleError::PortsNotConfigured(_))));
    }

    #[test]
    fn test_resolve_rejects_unsafe_ids() {
        let config = LifecycleConfig::default();
        let result = ProjectRuntime::resolve(&config, &project("p1;rm", Some(8080), Some(80)));
        assert!(matches!(result, Err(LifecycleError::InvalidProject { .. })));
    }

    #[test]
    fn test_build_context_placeholder() {
        let config = LifecycleConfig {
            build_context: "/srv/projects/{project_id}/src".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.build_context_for("p1"),
            PathBuf::from("/srv/projects/p1/src")
        );
    }
}
