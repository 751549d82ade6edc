//! Shared utilities

pub mod clock;
pub mod queue;
pub mod throttle;

pub use clock::{now_pts, Pts, PTS_PER_MILLISECOND, PTS_PER_SECOND};
pub use queue::BoundedQueue;
pub use throttle::LogThrottler;
