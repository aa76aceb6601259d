//! Tabshell - update shell for a new-tab dashboard
//!
//! Serves the bundled entry point instantly and, in the background, checks
//! the remote origin for a newer version, precaches it and switches to it
//! on the next tab. Settings written by either version share one store.

pub mod bridge;
pub mod common;
pub mod config;
pub mod shell;
pub mod storage;
pub mod update;
