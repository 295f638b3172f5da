//! Nanosecond clock helpers.
//!
//! All scheduler arithmetic is done on `u64` nanoseconds relative to a
//! process-wide epoch taken on first use. Timestamps never go backwards and
//! survive comparison against deadlines without conversion.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since the process epoch.
pub fn now() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Pin the epoch early so the first measured timestamp is near zero.
pub fn init_epoch() {
    EPOCH.get_or_init(Instant::now);
}
