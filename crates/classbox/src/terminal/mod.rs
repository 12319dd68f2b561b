//! Browser terminal sessions.
//!
//! A session is an interactive shell exec'd inside a project's running
//! container and bridged to one client connection. Each shell exports a
//! unique marker into its environment; tearing the session down kills every
//! process carrying that marker, so nothing a user started outlives their
//! terminal.

mod bridge;
mod error;
mod session;

pub use bridge::{EventSender, TerminalBridge};
pub use error::TerminalError;
pub use session::{
    SessionMetadata, Utf8Decoder, is_valid_marker, new_session_marker, shell_command,
    sweep_command, swept_pids,
};

use serde::{Deserialize, Serialize};

use crate::container::{ContainerResult, validate_env_var_key};

/// Terminal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell binary inside the container.
    pub shell: String,
    /// User the shell runs as. Runtime default when unset.
    pub user: Option<String>,
    /// Working directory of the shell.
    pub workdir: Option<String>,
    pub term: String,
    pub lang: String,
    /// Idle seconds before the shell logs out (`TMOUT`). 0 disables.
    pub idle_timeout_secs: u64,
    /// Environment variable carrying the session marker.
    pub marker_env: String,
    /// Seconds between orphaned session sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            user: Some("root".to_string()),
            workdir: None,
            term: "xterm-256color".to_string(),
            lang: "en_US.UTF-8".to_string(),
            idle_timeout_secs: 900,
            marker_env: "CLASSBOX_SESSION".to_string(),
            sweep_interval_secs: 60,
        }
    }
}

impl TerminalConfig {
    /// The shell path and marker variable end up in shell scripts.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_env_var_key(&self.marker_env)?;
        let shell_ok = self.shell.starts_with('/')
            && self
                .shell
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'));
        if !shell_ok {
            return Err(crate::container::ContainerError::InvalidInput(format!(
                "shell must be an absolute path without special characters: {}",
                self.shell
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(crate::container::ContainerError::InvalidInput(
                "sweep interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
