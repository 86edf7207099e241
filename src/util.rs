// src/util.rs

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time, seconds, as a float — the timestamp unit used throughout
/// the event/dedup pipeline (matches the original `time.time()` semantics).
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
