//! I/O helpers for toolgate commands.

pub mod checks;
pub mod config;
pub mod event;
pub mod git;
pub mod init;
pub mod lock;
pub mod process;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod workspace;
