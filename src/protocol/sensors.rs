//! Sensors channel messages
//!
//! Device-event injection (mouse/keyboard/gamepad) is handled by external
//! controllers; the transport only needs the controller's latency probe.

pub use crate::protocol::service::OriginPts;
