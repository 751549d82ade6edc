//! Video converter boundary
//!
//! The converter performs scaling and color-space conversion ahead of the
//! encoder whenever the encoder cannot ingest the captured surface directly.
//! GPU converters live behind [`VideoConvertEngine`]; the software engine
//! here keeps development builds and tests running.

use bytes::Bytes;

use crate::error::{Result, StreamError};
use crate::video::format::{ColorInfo, ColorRange, Resolution, SurfaceFormat};
use crate::video::frame::VideoSurface;

/// Converter (re)initialization parameters
#[derive(Debug, Clone)]
pub struct ConverterSetup {
    pub input_format: SurfaceFormat,
    pub input_resolution: Resolution,
    pub output_format: SurfaceFormat,
    pub output_resolution: Resolution,
    pub output_color: ColorInfo,
    pub output_range: ColorRange,
    /// Letterbox into the output rectangle instead of stretching
    pub preserve_aspect_ratio: bool,
}

pub trait VideoConvertEngine: Send {
    fn init(&mut self, setup: &ConverterSetup) -> Result<()>;
    fn terminate(&mut self);
    fn convert(&mut self, surface: &VideoSurface) -> Result<VideoSurface>;
}

/// CPU converter that rescales with nearest-neighbor sampling. Quality is
/// secondary here; it exists so the pipeline's converter path is exercised
/// end to end without a GPU.
pub struct SoftwareConverter {
    setup: Option<ConverterSetup>,
}

impl SoftwareConverter {
    pub fn new() -> Self {
        Self { setup: None }
    }
}

impl Default for SoftwareConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoConvertEngine for SoftwareConverter {
    fn init(&mut self, setup: &ConverterSetup) -> Result<()> {
        self.setup = Some(setup.clone());
        Ok(())
    }

    fn terminate(&mut self) {
        self.setup = None;
    }

    fn convert(&mut self, surface: &VideoSurface) -> Result<VideoSurface> {
        let setup = self
            .setup
            .as_ref()
            .ok_or_else(|| StreamError::NotInitialized("video converter".to_string()))?;

        let in_res = surface.resolution;
        let out_res = setup.output_resolution;

        // Treat the input as one byte per pixel for the rescale; enough to
        // carry recognizable content through tests.
        let in_len = (in_res.width * in_res.height) as usize;
        let src = if surface.data.len() >= in_len {
            &surface.data[..in_len]
        } else {
            &surface.data[..]
        };

        let mut out = vec![0u8; (out_res.width * out_res.height) as usize];
        if !src.is_empty() {
            for y in 0..out_res.height {
                let sy = y * in_res.height / out_res.height;
                for x in 0..out_res.width {
                    let sx = x * in_res.width / out_res.width;
                    let src_idx = (sy * in_res.width + sx) as usize;
                    if src_idx < src.len() {
                        out[(y * out_res.width + x) as usize] = src[src_idx];
                    }
                }
            }
        }

        Ok(VideoSurface {
            resolution: out_res,
            format: setup.output_format,
            color: setup.output_color,
            rotation: surface.rotation,
            dcc: false,
            srgb_view: false,
            origin_pts: surface.origin_pts,
            pts: surface.pts,
            duration: surface.duration,
            data: Bytes::from(out),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::{ColorPrimaries, TransferCharacteristic};

    fn setup(out: Resolution) -> ConverterSetup {
        ConverterSetup {
            input_format: SurfaceFormat::Bgra8,
            input_resolution: Resolution::new(4, 4),
            output_format: SurfaceFormat::Nv12,
            output_resolution: out,
            output_color: ColorInfo {
                primaries: ColorPrimaries::Bt709,
                transfer: TransferCharacteristic::Bt709,
            },
            output_range: ColorRange::Full,
            preserve_aspect_ratio: false,
        }
    }

    fn surface_4x4() -> VideoSurface {
        VideoSurface {
            resolution: Resolution::new(4, 4),
            format: SurfaceFormat::Bgra8,
            color: ColorInfo::default(),
            rotation: Default::default(),
            dcc: false,
            srgb_view: false,
            origin_pts: 0,
            pts: 100,
            duration: 10,
            data: Bytes::from((0u8..16).collect::<Vec<_>>()),
        }
    }

    #[test]
    fn test_convert_changes_format_and_resolution() {
        let mut converter = SoftwareConverter::new();
        converter.init(&setup(Resolution::new(2, 2))).unwrap();
        let out = converter.convert(&surface_4x4()).unwrap();
        assert_eq!(out.resolution, Resolution::new(2, 2));
        assert_eq!(out.format, SurfaceFormat::Nv12);
        assert_eq!(out.pts, 100);
        assert_eq!(out.data.len(), 4);
    }

    #[test]
    fn test_convert_before_init_fails() {
        let mut converter = SoftwareConverter::new();
        let err = converter.convert(&surface_4x4()).unwrap_err();
        assert!(matches!(err, StreamError::NotInitialized(_)));
    }
}
