//! Cursor shape model
//!
//! Cursor capture is an OS integration living outside this crate; whatever
//! produces shapes hands them over in this form for fan-out on the video
//! channel.

use bytes::Bytes;

use crate::video::format::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Color,
    Monochrome,
}

impl CursorKind {
    pub fn to_wire(self) -> u32 {
        match self {
            CursorKind::Color => 0,
            CursorKind::Monochrome => 1,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(CursorKind::Color),
            1 => Some(CursorKind::Monochrome),
            _ => None,
        }
    }
}

/// A cursor bitmap with its hotspot and the resolution it was captured at
#[derive(Debug, Clone)]
pub struct Cursor {
    pub bitmap: Bytes,
    pub resolution: Resolution,
    pub hotspot: (i32, i32),
    pub capture_resolution: Resolution,
    pub kind: CursorKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_round_trip() {
        for kind in [CursorKind::Color, CursorKind::Monochrome] {
            assert_eq!(CursorKind::from_wire(kind.to_wire()), Some(kind));
        }
        assert_eq!(CursorKind::from_wire(7), None);
    }
}
