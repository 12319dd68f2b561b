//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The control plane cannot be reached (socket missing, refused, timed out).
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Exec instance was not found.
    #[error("exec not found: {0}")]
    ExecNotFound(String),

    /// The runtime refused because of a conflicting object (e.g. name in use).
    #[error("conflict: {0}")]
    Conflict(String),

    /// `build` exited unsuccessfully.
    #[error("image build failed for {image}: {message}")]
    BuildFailed { image: String, message: String },

    /// A runtime API call or CLI command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether the error means the object being looked up does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ContainerError::ContainerNotFound(_)
                | ContainerError::ImageNotFound(_)
                | ContainerError::ExecNotFound(_)
        )
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ContainerError::Unavailable(_))
    }
}
