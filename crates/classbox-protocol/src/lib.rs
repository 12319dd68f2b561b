//! Wire types shared by the classbox server and its clients.
//!
//! - [`lifecycle`]: project start/status responses and the phase enum.
//! - [`terminal`]: commands and events carried over the terminal channel.

pub mod lifecycle;
pub mod terminal;

pub use lifecycle::{Phase, StartResponse, StatusResponse};
pub use terminal::{TerminalCommand, TerminalEvent, TerminalSessionInfo};
