//! Project records and access checks.
//!
//! Project bookkeeping lives outside this service; the orchestrator and the
//! terminal bridge only need to look a project up, check membership, and
//! record the container created for it. [`ProjectDirectory`] is that seam.
//! [`ProjectRepository`] implements it on the local SQLite database for
//! standalone deployments.

mod models;
mod repository;

pub use models::{NewProject, Project};
pub use repository::ProjectRepository;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

/// Lookup, authorization and write-back for project records.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn get_project(&self, project_id: &str) -> Result<Option<Project>>;

    /// Whether `actor` may operate `project`.
    async fn is_member(&self, actor: &str, project: &Project) -> Result<bool>;

    /// Record the container created for the project.
    async fn set_container_id(&self, project_id: &str, container_id: &str) -> Result<()>;
}

/// Why an actor cannot operate a project.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("project not found: {0}")]
    NotFound(String),

    #[error("not a member of project {0}")]
    Forbidden(String),

    #[error("project lookup failed: {0:#}")]
    Lookup(anyhow::Error),
}

/// Look up `project_id` and check that `actor` is a member.
pub async fn authorize(
    directory: &dyn ProjectDirectory,
    actor: &str,
    project_id: &str,
) -> Result<Project, AccessError> {
    let project = directory
        .get_project(project_id)
        .await
        .map_err(AccessError::Lookup)?
        .ok_or_else(|| AccessError::NotFound(project_id.to_string()))?;

    if !directory
        .is_member(actor, &project)
        .await
        .map_err(AccessError::Lookup)?
    {
        return Err(AccessError::Forbidden(project_id.to_string()));
    }

    Ok(project)
}
