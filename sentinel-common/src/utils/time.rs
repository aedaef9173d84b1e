use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current UNIX timestamp in milliseconds.
///
/// Used to stamp protocol messages, proposals and node heartbeats.
/// A clock set before the epoch yields `0` rather than panicking.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
