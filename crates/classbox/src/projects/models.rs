//! Project data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A student project as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Project {
    /// Unique project ID (a UUID in practice).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Port published on the host.
    pub host_port: Option<i64>,
    /// Port the project listens on inside the container.
    pub container_port: Option<i64>,
    /// Runtime ID of the container, recorded after it was first created.
    pub container_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Project {
    /// Both ports, if assigned and in range.
    pub fn ports(&self) -> Option<(u16, u16)> {
        let host = u16::try_from(self.host_port?).ok().filter(|p| *p != 0)?;
        let container = u16::try_from(self.container_port?).ok().filter(|p| *p != 0)?;
        Some((host, container))
    }
}

/// Input for creating or updating a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub id: String,
    pub name: String,
    pub host_port: Option<u16>,
    pub container_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(host: Option<i64>, container: Option<i64>) -> Project {
        Project {
            id: "p1".to_string(),
            name: "Demo".to_string(),
            host_port: host,
            container_port: container,
            container_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_ports_require_both_sides() {
        assert_eq!(project(Some(8080), Some(80)).ports(), Some((8080, 80)));
        assert_eq!(project(Some(8080), None).ports(), None);
        assert_eq!(project(None, Some(80)).ports(), None);
    }

    #[test]
    fn test_ports_reject_out_of_range() {
        assert_eq!(project(Some(70000), Some(80)).ports(), None);
        assert_eq!(project(Some(0), Some(80)).ports(), None);
        assert_eq!(project(Some(-1), Some(80)).ports(), None);
    }
}
