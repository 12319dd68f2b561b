//! Project container lifecycle: `stopped -> starting -> running | stopped`.

mod models;
mod orchestrator;

pub use models::{
    LifecycleConfig, LifecycleError, PhaseRecord, ProjectRuntime, StartOutcome,
};
pub use orchestrator::LifecycleOrchestrator;
