//! Deterministic quality control for coding-agent tool events.
//!
//! Every hook invocation is a short-lived process that reads one event,
//! consults and updates durable state under `.toolgate/`, prints a JSON
//! result, and exits. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, fix plans,
//!   fix-queue folding, task lifecycle, metrics, pattern counters).
//! - **[`io`]**: Side effects (state store and locks, git, subprocesses,
//!   snapshots, config, event parsing).
//!
//! Orchestration modules ([`gate`], [`heal`], [`fixes`], [`tasks`], [`learn`],
//! [`status`]) combine the two to implement each command.

pub mod core;
pub mod exit_codes;
pub mod fixes;
pub mod gate;
pub mod heal;
pub mod incidents;
pub mod io;
pub mod learn;
pub mod logging;
pub mod session;
pub mod status;
pub mod tasks;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
