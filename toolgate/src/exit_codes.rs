//! Stable exit codes for toolgate commands.

/// Change accepted, or an operator command succeeded.
pub const OK: i32 = 0;
/// Invalid usage, config, or state; operator errors such as starting a second task.
pub const INVALID: i32 = 1;
/// A gate check failed. The workspace was rolled back if a pre-change
/// baseline existed (`baseline_pre_change` on the report).
pub const REJECTED: i32 = 2;
/// Change accepted, but at least one check was skipped because its program is missing.
pub const DEGRADED: i32 = 3;
/// A gate check failed and restoring the baseline also failed.
pub const ROLLBACK_FAILED: i32 = 4;
/// No baseline could be established, so no check ran. The change is left in place.
pub const BASELINE_FAILED: i32 = 5;
