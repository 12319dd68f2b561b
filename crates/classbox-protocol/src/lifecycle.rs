//! Project lifecycle types.

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a project's container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No running container (or none at all).
    #[default]
    Stopped,
    /// A build-and-start sequence is in flight.
    Starting,
    /// The container is up.
    Running,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Stopped => "stopped",
            Phase::Starting => "starting",
            Phase::Running => "running",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Phase::Stopped),
            "starting" => Ok(Phase::Starting),
            "running" => Ok(Phase::Running),
            _ => Err(format!("unknown phase: {}", s)),
        }
    }
}

/// Response to a start request. Always `accepted`; the phase reports
/// `starting` whether this request launched the sequence or joined one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResponse {
    pub accepted: bool,
    pub phase: Phase,
}

impl StartResponse {
    pub fn starting() -> Self {
        Self {
            accepted: true,
            phase: Phase::Starting,
        }
    }
}

/// Response to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub project_id: String,
    pub phase: Phase,
}
