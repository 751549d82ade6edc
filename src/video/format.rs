//! Video formats and geometry

use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Uncompressed surface pixel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceFormat {
    Nv12,
    Yuv420,
    Bgra8,
    Rgba8,
    Rgba16F,
    P010,
}

impl fmt::Display for SurfaceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SurfaceFormat::Nv12 => "NV12",
            SurfaceFormat::Yuv420 => "YUV420",
            SurfaceFormat::Bgra8 => "BGRA8",
            SurfaceFormat::Rgba8 => "RGBA8",
            SurfaceFormat::Rgba16F => "RGBA16F",
            SurfaceFormat::P010 => "P010",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorPrimaries {
    #[default]
    Undefined,
    Bt709,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferCharacteristic {
    #[default]
    Undefined,
    Bt709,
    /// SMPTE 2084 perceptual quantizer (HDR)
    Pq,
    Srgb,
}

/// Color range an encoder can ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorRange {
    Full,
    Studio,
}

/// Color description attached to a captured surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorInfo {
    pub primaries: ColorPrimaries,
    pub transfer: TransferCharacteristic,
}

/// Capture surface rotation reported by the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

/// Axis-aligned rectangle, used for viewports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// Compute the letterbox viewport for an input rendered into a stream
/// rectangle with its aspect ratio preserved. The viewport is centered and
/// maximized; the uncovered stream area is black bars.
pub fn letterbox_viewport(input: Resolution, stream: Resolution) -> Rect {
    let input_aspect = input.aspect_ratio();
    let stream_aspect = stream.aspect_ratio();
    if input_aspect == stream_aspect {
        Rect::new(0, 0, stream.width as i32, stream.height as i32)
    } else if input_aspect < stream_aspect {
        // Input is narrower than the stream, black bars on the sides
        let viewport_width = (stream.height as f64 * input_aspect) as i32;
        let left = (stream.width as i32 - viewport_width) / 2;
        Rect::new(left, 0, stream.width as i32 - left, stream.height as i32)
    } else {
        // Input is wider than the stream, black bars above and below
        let viewport_height = (stream.width as f64 / input_aspect) as i32;
        let top = (stream.height as i32 - viewport_height) / 2;
        Rect::new(0, top, stream.width as i32, stream.height as i32 - top)
    }
}
