//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::lifecycle::LifecycleOrchestrator;
use crate::projects::ProjectDirectory;
use crate::terminal::TerminalBridge;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Project lookup and membership checks.
    pub projects: Arc<dyn ProjectDirectory>,
    pub lifecycle: LifecycleOrchestrator,
    pub terminals: TerminalBridge,
    pub auth: AuthState,
    /// Whether the shared store backend is reachable (reported by /health).
    pub shared_store: bool,
}

impl AppState {
    pub fn new(
        projects: Arc<dyn ProjectDirectory>,
        lifecycle: LifecycleOrchestrator,
        terminals: TerminalBridge,
        auth: AuthState,
        shared_store: bool,
    ) -> Self {
        Self {
            projects,
            lifecycle,
            terminals,
            auth,
            shared_store,
        }
    }
}
