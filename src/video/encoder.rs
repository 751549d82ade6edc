//! Video encode engine boundary
//!
//! Hardware encoders (H.264/HEVC/AV1) live behind [`VideoEncodeEngine`];
//! the pipeline only depends on the capability surface needed for its
//! converter decision and reinitialization logic. A loopback engine is
//! provided for development and tests.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};

use crate::error::{Result, StreamError};
use crate::utils::Pts;
use crate::video::format::{ColorInfo, ColorRange, Resolution, SurfaceFormat};
use crate::video::frame::{SubframeType, VideoSurface};

/// String-keyed configuration bag for codec-specific esoterica. The common
/// knobs have typed setters; everything else goes through `set`.
#[derive(Debug, Clone, Default)]
pub struct PropertyBag {
    values: HashMap<String, String>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn set_bitrate(&mut self, bitrate: i64) -> &mut Self {
        self.set("bitrate", bitrate)
    }

    pub fn set_framerate(&mut self, framerate: f32) -> &mut Self {
        self.set("framerate", framerate)
    }

    pub fn set_resolution(&mut self, resolution: Resolution) -> &mut Self {
        self.set("width", resolution.width);
        self.set("height", resolution.height)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Everything the encoder needs at (re)initialization
#[derive(Debug, Clone)]
pub struct VideoEncoderSetup {
    pub resolution: Resolution,
    pub bitrate: i64,
    pub framerate: f32,
    pub intra_refresh_period: i64,
    pub input_format: SurfaceFormat,
    pub input_color: ColorInfo,
    pub hdr: bool,
    pub extra: PropertyBag,
}

/// One frame handed to the encoder
pub struct EncoderInput {
    pub surface: VideoSurface,
    pub force_key_frame: bool,
    /// Stamped when the frame entered the encoder, for latency measurement
    pub encoder_in_pts: Pts,
}

/// One compressed frame coming out of the encoder
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Bytes,
    pub subframe_type: SubframeType,
    pub pts: Pts,
    pub duration: Pts,
    pub origin_pts: Pts,
    pub encoder_in_pts: Pts,
}

/// Capability and control surface of a hardware video encoder.
pub trait VideoEncodeEngine: Send {
    fn codec_name(&self) -> &str;

    fn init(&mut self, setup: &VideoEncoderSetup) -> Result<()>;
    fn terminate(&mut self);

    /// Codec init block (e.g. SPS/PPS); refreshed on every `init`.
    fn extradata(&self) -> Option<Bytes>;

    fn is_hdr_supported(&self) -> bool;
    fn supported_color_range(&self) -> ColorRange;
    fn preferred_sdr_format(&self) -> SurfaceFormat;
    fn preferred_hdr_format(&self) -> SurfaceFormat;
    /// Can the encoder ingest this surface format directly (EFC)?
    fn is_format_supported(&self, format: SurfaceFormat) -> bool;

    /// Non-blocking submit; `InputFull` when the encoder queue is saturated.
    fn submit(&mut self, input: EncoderInput) -> Result<()>;
    /// Non-blocking poll for the next compressed frame.
    fn query_output(&mut self) -> Result<Option<EncodedFrame>>;

    fn update_bitrate(&mut self, bitrate: i64) -> Result<()>;
    fn update_framerate(&mut self, framerate: f32) -> Result<()>;
    fn framerate(&self) -> f32;
}

/// Software loopback engine: wraps raw surface bytes as "compressed" frames
/// with a GOP structure. Stands in for a hardware encoder in development
/// builds and in every pipeline test.
pub struct LoopbackEncoder {
    setup: Option<VideoEncoderSetup>,
    framerate: f32,
    gop_size: u64,
    frames_since_key: u64,
    queue: VecDeque<EncodedFrame>,
    queue_limit: usize,
}

impl LoopbackEncoder {
    pub const CODEC_NAME: &'static str = "loopback";

    pub fn new(gop_size: u64) -> Self {
        Self {
            setup: None,
            framerate: 0.0,
            gop_size: gop_size.max(1),
            frames_since_key: 0,
            queue: VecDeque::new(),
            queue_limit: 16,
        }
    }

    fn build_extradata(setup: &VideoEncoderSetup) -> Bytes {
        // A minimal self-describing header standing in for SPS/PPS
        let mut buf = BytesMut::with_capacity(16);
        buf.put_slice(b"LBK0");
        buf.put_u32(setup.resolution.width);
        buf.put_u32(setup.resolution.height);
        buf.put_u8(if setup.hdr { 10 } else { 8 });
        buf.freeze()
    }
}

impl VideoEncodeEngine for LoopbackEncoder {
    fn codec_name(&self) -> &str {
        Self::CODEC_NAME
    }

    fn init(&mut self, setup: &VideoEncoderSetup) -> Result<()> {
        self.framerate = setup.framerate;
        self.frames_since_key = 0;
        self.queue.clear();
        self.setup = Some(setup.clone());
        Ok(())
    }

    fn terminate(&mut self) {
        self.setup = None;
        self.queue.clear();
        self.frames_since_key = 0;
    }

    fn extradata(&self) -> Option<Bytes> {
        self.setup.as_ref().map(Self::build_extradata)
    }

    fn is_hdr_supported(&self) -> bool {
        false
    }

    fn supported_color_range(&self) -> ColorRange {
        ColorRange::Full
    }

    fn preferred_sdr_format(&self) -> SurfaceFormat {
        SurfaceFormat::Nv12
    }

    fn preferred_hdr_format(&self) -> SurfaceFormat {
        SurfaceFormat::P010
    }

    fn is_format_supported(&self, format: SurfaceFormat) -> bool {
        matches!(format, SurfaceFormat::Nv12 | SurfaceFormat::Bgra8)
    }

    fn submit(&mut self, input: EncoderInput) -> Result<()> {
        if self.setup.is_none() {
            return Err(StreamError::NotInitialized("loopback encoder".to_string()));
        }
        if self.queue.len() >= self.queue_limit {
            return Err(StreamError::InputFull);
        }

        let key = input.force_key_frame || self.frames_since_key == 0;
        let subframe_type = if key {
            self.frames_since_key = 0;
            SubframeType::Idr
        } else {
            SubframeType::P
        };
        self.frames_since_key = (self.frames_since_key + 1) % self.gop_size;

        self.queue.push_back(EncodedFrame {
            data: input.surface.data.clone(),
            subframe_type,
            pts: input.surface.pts,
            duration: input.surface.duration,
            origin_pts: input.surface.origin_pts,
            encoder_in_pts: input.encoder_in_pts,
        });
        Ok(())
    }

    fn query_output(&mut self) -> Result<Option<EncodedFrame>> {
        Ok(self.queue.pop_front())
    }

    fn update_bitrate(&mut self, bitrate: i64) -> Result<()> {
        if let Some(setup) = self.setup.as_mut() {
            setup.bitrate = bitrate;
            Ok(())
        } else {
            Err(StreamError::NotInitialized("loopback encoder".to_string()))
        }
    }

    fn update_framerate(&mut self, framerate: f32) -> Result<()> {
        if self.setup.is_none() {
            return Err(StreamError::NotInitialized("loopback encoder".to_string()));
        }
        self.framerate = framerate;
        Ok(())
    }

    fn framerate(&self) -> f32 {
        self.framerate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{ColorPrimaries, TransferCharacteristic};

    fn setup() -> VideoEncoderSetup {
        VideoEncoderSetup {
            resolution: Resolution::HD1080,
            bitrate: 20_000_000,
            framerate: 60.0,
            intra_refresh_period: 0,
            input_format: SurfaceFormat::Nv12,
            input_color: ColorInfo {
                primaries: ColorPrimaries::Bt709,
                transfer: TransferCharacteristic::Bt709,
            },
            hdr: false,
            extra: PropertyBag::new(),
        }
    }

    fn surface(pts: Pts) -> VideoSurface {
        VideoSurface {
            resolution: Resolution::HD1080,
            format: SurfaceFormat::Nv12,
            color: ColorInfo::default(),
            rotation: Default::default(),
            dcc: false,
            srgb_view: false,
            origin_pts: pts,
            pts,
            duration: 166_667,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        }
    }

    #[test]
    fn test_first_frame_is_idr() {
        let mut encoder = LoopbackEncoder::new(30);
        encoder.init(&setup()).unwrap();
        encoder
            .submit(EncoderInput {
                surface: surface(0),
                force_key_frame: false,
                encoder_in_pts: 0,
            })
            .unwrap();
        let frame = encoder.query_output().unwrap().unwrap();
        assert_eq!(frame.subframe_type, SubframeType::Idr);
    }

    #[test]
    fn test_force_key_frame_overrides_gop() {
        let mut encoder = LoopbackEncoder::new(30);
        encoder.init(&setup()).unwrap();
        for i in 0..3 {
            encoder
                .submit(EncoderInput {
                    surface: surface(i),
                    force_key_frame: false,
                    encoder_in_pts: 0,
                })
                .unwrap();
        }
        encoder
            .submit(EncoderInput {
                surface: surface(3),
                force_key_frame: true,
                encoder_in_pts: 0,
            })
            .unwrap();
        let types: Vec<_> = std::iter::from_fn(|| encoder.query_output().unwrap())
            .map(|f| f.subframe_type)
            .collect();
        assert_eq!(
            types,
            vec![
                SubframeType::Idr,
                SubframeType::P,
                SubframeType::P,
                SubframeType::Idr
            ]
        );
    }

    #[test]
    fn test_extradata_tracks_resolution() {
        let mut encoder = LoopbackEncoder::new(30);
        let mut s = setup();
        encoder.init(&s).unwrap();
        let first = encoder.extradata().unwrap();
        s.resolution = Resolution::new(2560, 1440);
        encoder.init(&s).unwrap();
        let second = encoder.extradata().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_submit_before_init_fails() {
        let mut encoder = LoopbackEncoder::new(30);
        let err = encoder
            .submit(EncoderInput {
                surface: surface(0),
                force_key_frame: false,
                encoder_in_pts: 0,
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::NotInitialized(_)));
    }

    #[test]
    fn test_property_bag_typed_setters() {
        let mut bag = PropertyBag::new();
        bag.set_bitrate(5_000_000);
        bag.set_resolution(Resolution::new(1280, 720));
        bag.set("rate_control", "cbr");
        assert_eq!(bag.get("bitrate"), Some("5000000"));
        assert_eq!(bag.get("width"), Some("1280"));
        assert_eq!(bag.get("rate_control"), Some("cbr"));
    }
}
