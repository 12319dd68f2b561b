//! Authentication module.
//!
//! Verifies who is calling; what they may do is decided per project by the
//! project directory. Supports:
//! - HS256 JWT validation
//! - Dev bypass mode with configured test users

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError, DevUser};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, auth_middleware};
