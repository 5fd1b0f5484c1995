//! Small helpers shared across the filesystem core.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current timestamp since the Unix epoch.
pub fn get_timestamp() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
}

/// Returns the current timestamp truncated to whole seconds, the unit stored in inode records.
pub fn timestamp_secs() -> u32 {
    get_timestamp().as_secs() as u32
}
