//! Monotonic presentation clock
//!
//! All timestamps in the pipeline are 100-nanosecond ticks measured from
//! process start. Using a single origin keeps video pts, audio pts and the
//! latency probes on one timeline and makes init IDs naturally monotonic.

use std::sync::OnceLock;
use std::time::Instant;

/// Presentation timestamp in 100 ns ticks
pub type Pts = i64;

/// Ticks per second (100 ns resolution)
pub const PTS_PER_SECOND: i64 = 10_000_000;

/// Ticks per millisecond
pub const PTS_PER_MILLISECOND: i64 = PTS_PER_SECOND / 1000;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

fn origin() -> Instant {
    *ORIGIN.get_or_init(Instant::now)
}

/// Current time on the shared pipeline clock
pub fn now_pts() -> Pts {
    let elapsed = origin().elapsed();
    (elapsed.as_secs() as i64) * PTS_PER_SECOND + (elapsed.subsec_nanos() as i64) / 100
}

/// Convert a tick count to seconds
pub fn pts_to_secs(pts: Pts) -> f32 {
    pts as f32 / PTS_PER_SECOND as f32
}

/// Convert seconds to ticks
pub fn secs_to_pts(secs: f32) -> Pts {
    (secs * PTS_PER_SECOND as f32) as Pts
}
