//! Time-ordered unique identifiers for incidents, fix tasks and work items.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Build `<prefix>_<UTC timestamp to the microsecond>_<6 hex chars>`.
///
/// Ids sort lexicographically by creation time; the random suffix keeps ids
/// unique across processes created within the same microsecond.
pub fn new_id(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{prefix}_{}_{}",
        now.format("%Y%m%d%H%M%S%6f"),
        &suffix[..6]
    )
}
