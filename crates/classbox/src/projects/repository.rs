//! Project database repository.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use super::ProjectDirectory;
use super::models::{NewProject, Project};

/// Repository for project records and memberships.
#[derive(Debug, Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a project, or update name and ports of an existing one.
    pub async fn upsert(&self, project: &NewProject) -> Result<Project> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, host_port, container_port)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                host_port = excluded.host_port,
                container_port = excluded.container_port,
                updated_at = datetime('now')
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(project.host_port.map(i64::from))
        .bind(project.container_port.map(i64::from))
        .execute(&self.pool)
        .await
        .context("upserting project")?;

        self.get(&project.id)
            .await?
            .with_context(|| format!("project {} vanished after upsert", project.id))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(
            r#"
            SELECT id, name, host_port, container_port, container_id, created_at, updated_at
            FROM projects
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching project")?;

        Ok(project)
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            r#"
            SELECT id, name, host_port, container_port, container_id, created_at, updated_at
            FROM projects
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing projects")?;

        Ok(projects)
    }

    pub async fn add_member(&self, project_id: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_members (project_id, user_id)
            VALUES (?, ?)
            ON CONFLICT(project_id, user_id) DO NOTHING
            "#,
        )
        .bind(project_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("adding project member")?;

        Ok(())
    }

    pub async fn members(&self, project_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM project_members WHERE project_id = ? ORDER BY user_id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .context("listing project members")?;

        Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
    }
}

#[async_trait]
impl ProjectDirectory for ProjectRepository {
    async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        self.get(project_id).await
    }

    async fn is_member(&self, actor: &str, project: &Project) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM project_members WHERE project_id = ? AND user_id = ?",
        )
        .bind(&project.id)
        .bind(actor)
        .fetch_optional(&self.pool)
        .await
        .context("checking project membership")?;

        Ok(row.is_some())
    }

    async fn set_container_id(&self, project_id: &str, container_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE projects
            SET container_id = ?, updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(container_id)
        .bind(project_id)
        .execute(&self.pool)
        .await
        .context("recording project container")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn repo() -> ProjectRepository {
        let db = Database::in_memory().await.unwrap();
        ProjectRepository::new(db.pool().clone())
    }

    fn new_project(id: &str) -> NewProject {
        NewProject {
            id: id.to_string(),
            name: "Databases 101".to_string(),
            host_port: Some(8081),
            container_port: Some(5000),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let repo = repo().await;
        let created = repo.upsert(&new_project("p1")).await.unwrap();
        assert_eq!(created.ports(), Some((8081, 5000)));
        assert_eq!(created.container_id, None);

        let mut changed = new_project("p1");
        changed.host_port = Some(9090);
        let updated = repo.upsert(&changed).await.unwrap();
        assert_eq!(updated.ports(), Some((9090, 5000)));
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_membership() {
        let repo = repo().await;
        let project = repo.upsert(&new_project("p1")).await.unwrap();

        assert!(!repo.is_member("alice", &project).await.unwrap());
        repo.add_member("p1", "alice").await.unwrap();
        repo.add_member("p1", "alice").await.unwrap();
        assert!(repo.is_member("alice", &project).await.unwrap());
        assert!(!repo.is_member("bob", &project).await.unwrap());
        assert_eq!(repo.members("p1").await.unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_set_container_id() {
        let repo = repo().await;
        repo.upsert(&new_project("p1")).await.unwrap();
        repo.set_container_id("p1", "abc123").await.unwrap();

        let project = repo.get_project("p1").await.unwrap().unwrap();
        assert_eq!(project.container_id.as_deref(), Some("abc123"));
    }
}
