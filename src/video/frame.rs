//! Captured surfaces and transmittable frames

use bytes::Bytes;

use crate::error::{Result, StreamError};
use crate::utils::Pts;
use crate::video::format::{ColorInfo, Resolution, Rotation, SurfaceFormat};

/// View a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewType {
    Monoscopic,
    LeftEye,
    RightEye,
    Multiview,
}

impl ViewType {
    pub fn to_wire(self) -> u32 {
        match self {
            ViewType::Monoscopic => 0,
            ViewType::LeftEye => 1,
            ViewType::RightEye => 2,
            ViewType::Multiview => 3,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(ViewType::Monoscopic),
            1 => Some(ViewType::LeftEye),
            2 => Some(ViewType::RightEye),
            3 => Some(ViewType::Multiview),
            _ => None,
        }
    }
}

/// Compressed subframe classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubframeType {
    Idr,
    I,
    P,
    B,
    Slice,
    Transparency,
    Unknown,
}

impl SubframeType {
    /// True for frames decodable without prior reference frames.
    pub fn is_key(self) -> bool {
        matches!(self, SubframeType::Idr | SubframeType::I)
    }

    pub fn to_wire(self) -> u32 {
        match self {
            SubframeType::Idr => 0,
            SubframeType::I => 1,
            SubframeType::P => 2,
            SubframeType::B => 3,
            SubframeType::Slice => 4,
            SubframeType::Transparency => 5,
            SubframeType::Unknown => 6,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(SubframeType::Idr),
            1 => Some(SubframeType::I),
            2 => Some(SubframeType::P),
            3 => Some(SubframeType::B),
            4 => Some(SubframeType::Slice),
            5 => Some(SubframeType::Transparency),
            6 => Some(SubframeType::Unknown),
            _ => None,
        }
    }
}

/// A raw captured video surface on its way into the pipeline
#[derive(Debug, Clone)]
pub struct VideoSurface {
    pub resolution: Resolution,
    pub format: SurfaceFormat,
    pub color: ColorInfo,
    pub rotation: Rotation,
    /// Surface carries delta color compression and cannot be encoded natively
    pub dcc: bool,
    /// Surface is exposed through an sRGB-typed view; bypasses native encode
    pub srgb_view: bool,
    /// Capture/sensor timestamp for end-to-end latency measurement
    pub origin_pts: Pts,
    pub pts: Pts,
    pub duration: Pts,
    pub data: Bytes,
}

/// One compressed subframe of a transmittable frame
#[derive(Debug, Clone)]
pub struct Subframe {
    pub subframe_type: SubframeType,
    pub data: Bytes,
}

/// A compressed video frame ready for per-session fan-out.
///
/// All subframes share the frame's pts and duration; pushing a subframe
/// stamped differently is a contract violation, not a recoverable state.
#[derive(Debug, Clone)]
pub struct TransmittableVideoFrame {
    view_type: ViewType,
    origin_pts: Pts,
    pts: Pts,
    duration: Pts,
    sequence: u64,
    discontinuity: bool,
    encoder_latency: Pts,
    subframes: Vec<Subframe>,
}

impl TransmittableVideoFrame {
    pub fn new(
        view_type: ViewType,
        origin_pts: Pts,
        pts: Pts,
        duration: Pts,
        sequence: u64,
        discontinuity: bool,
    ) -> Self {
        Self {
            view_type,
            origin_pts,
            pts,
            duration,
            sequence,
            discontinuity,
            encoder_latency: 0,
            subframes: Vec::with_capacity(1),
        }
    }

    pub fn add_subframe(
        &mut self,
        subframe_type: SubframeType,
        data: Bytes,
        pts: Pts,
        duration: Pts,
    ) -> Result<()> {
        if pts != self.pts || duration != self.duration {
            return Err(StreamError::InvalidArg(format!(
                "subframe pts {}/{} does not match frame pts {}/{}",
                pts, duration, self.pts, self.duration
            )));
        }
        self.subframes.push(Subframe {
            subframe_type,
            data,
        });
        Ok(())
    }

    pub fn set_encoder_latency(&mut self, latency: Pts) {
        self.encoder_latency = latency;
    }

    pub fn view_type(&self) -> ViewType {
        self.view_type
    }

    pub fn origin_pts(&self) -> Pts {
        self.origin_pts
    }

    pub fn pts(&self) -> Pts {
        self.pts
    }

    pub fn duration(&self) -> Pts {
        self.duration
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn discontinuity(&self) -> bool {
        self.discontinuity
    }

    pub fn encoder_latency(&self) -> Pts {
        self.encoder_latency
    }

    pub fn subframes(&self) -> &[Subframe] {
        &self.subframes
    }

    /// Total payload size; fed to QoS as this frame's bandwidth contribution.
    pub fn payload_size(&self) -> usize {
        self.subframes.iter().map(|s| s.data.len()).sum()
    }
}
