//! Terminal session errors.

use thiserror::Error;

use crate::container::ContainerError;
use crate::projects::AccessError;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("container of project {0} is not running")]
    NotRunning(String),

    #[error("no terminal session is attached")]
    NoSession,

    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },

    #[error("failed to open shell: {0}")]
    Exec(ContainerError),

    #[error("terminal exec no longer exists")]
    ExecGone,

    #[error("failed to resize terminal: {0}")]
    Resize(ContainerError),

    #[error("terminal stream failed: {0}")]
    Stream(#[from] std::io::Error),
}

impl TerminalError {
    /// Authorization failures close the whole connection; everything else
    /// only ends the attempt or the session.
    pub fn ends_connection(&self) -> bool {
        matches!(self, TerminalError::Access(AccessError::Forbidden(_)))
    }
}
