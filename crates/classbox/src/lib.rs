//! Classbox: container lifecycle orchestration and browser terminals for
//! student project workspaces.
//!
//! The HTTP layer (`api`, `ws`) is thin; the interesting parts are the
//! [`lifecycle::LifecycleOrchestrator`], which builds and starts one
//! container per project without blocking callers, and the
//! [`terminal::TerminalBridge`], which attaches interactive shells to those
//! containers and reliably cleans up after them. Both coordinate across
//! worker processes through the [`store::SharedStore`].

pub mod api;
pub mod auth;
pub mod container;
pub mod db;
pub mod lifecycle;
pub mod projects;
pub mod store;
pub mod terminal;
pub mod ws;
