//! Terminal WebSocket transport.
//!
//! One WebSocket is one terminal connection: JSON text frames carry
//! `TerminalCommand`s in and `TerminalEvent`s out, binary frames from the
//! client are raw shell input.

mod handler;

pub use handler::ws_handler;
