//! Deterministic, pure logic shared by the toolgate commands.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod fix_plan;
pub mod fix_queue;
pub mod ids;
pub mod lifecycle;
pub mod metrics;
pub mod patterns;
pub mod signature;
pub mod types;
