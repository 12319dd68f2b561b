//! Terminal channel messages.
//!
//! A terminal channel is one persistent connection. The caller attaches to a
//! project's shell, streams input and resize requests, and receives output as
//! text. Messages are JSON objects tagged by `type`.

use serde::{Deserialize, Serialize};

/// Messages from the caller to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalCommand {
    /// Open a shell inside the project's running container.
    Attach { project_id: String },

    /// Keystrokes, written verbatim to the shell.
    Input { data: String },

    /// Change the pseudo-terminal geometry.
    Resize {
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default = "default_cols")]
        cols: u16,
    },

    /// Close the shell but keep the channel open.
    Detach,
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

/// Messages from the bridge to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    /// The shell is attached; output follows.
    Ready { project_id: String },

    /// Shell output, in the order it was produced.
    Output { data: String },

    /// Something went wrong with the attach attempt or the session.
    Error { message: String },

    /// The session ended. Always the last event of a session.
    Disconnected { reason: String },
}

impl TerminalEvent {
    pub fn error(message: impl Into<String>) -> Self {
        TerminalEvent::Error {
            message: message.into(),
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        TerminalEvent::Disconnected {
            reason: reason.into(),
        }
    }
}

/// Public view of a live terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSessionInfo {
    pub connection_id: String,
    pub project_id: String,
    pub actor: String,
    pub created_at_ms: i64,
}
