//! Timestamp calibrator
//!
//! Video pts comes from the presentation clock and audio pts from the device
//! clock; under low-latency capture the two drift apart and AV sync suffers.
//! The calibrator treats the video timeline as the master and shifts audio
//! pts by the offset observed between the first samples of each kind. Both
//! submit paths return promptly and mutate pts in place.

use crate::audio::buffer::AudioBuffer;
use crate::utils::Pts;
use crate::video::frame::VideoSurface;

pub struct TimestampCalibrator {
    first_video_pts: Option<Pts>,
    first_audio_pts: Option<Pts>,
    audio_offset: Option<Pts>,
}

impl TimestampCalibrator {
    pub fn new() -> Self {
        Self {
            first_video_pts: None,
            first_audio_pts: None,
            audio_offset: None,
        }
    }

    /// Reset the learned offset, e.g. when capture restarts.
    pub fn reset(&mut self) {
        self.first_video_pts = None;
        self.first_audio_pts = None;
        self.audio_offset = None;
    }

    fn learn_offset(&mut self) {
        if self.audio_offset.is_none() {
            if let (Some(video), Some(audio)) = (self.first_video_pts, self.first_audio_pts) {
                self.audio_offset = Some(video - audio);
            }
        }
    }

    pub fn submit_video(&mut self, surface: &mut VideoSurface) {
        if self.first_video_pts.is_none() {
            self.first_video_pts = Some(surface.pts);
            self.learn_offset();
        }
    }

    pub fn submit_audio(&mut self, buffer: &mut AudioBuffer) {
        if self.first_audio_pts.is_none() {
            self.first_audio_pts = Some(buffer.pts);
            self.learn_offset();
        }
        if let Some(offset) = self.audio_offset {
            buffer.pts += offset;
        }
    }
}

impl Default for TimestampCalibrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::AudioStreamParams;
    use crate::video::format::{ColorInfo, Resolution, Rotation, SurfaceFormat};
    use bytes::Bytes;

    fn surface(pts: Pts) -> VideoSurface {
        VideoSurface {
            resolution: Resolution::new(8, 8),
            format: SurfaceFormat::Nv12,
            color: ColorInfo::default(),
            rotation: Rotation::None,
            dcc: false,
            srgb_view: false,
            origin_pts: pts,
            pts,
            duration: 0,
            data: Bytes::new(),
        }
    }

    fn audio(pts: Pts) -> AudioBuffer {
        AudioBuffer {
            params: AudioStreamParams::default(),
            pts,
            duration: 0,
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_audio_aligned_to_video_timeline() {
        let mut calibrator = TimestampCalibrator::new();
        let mut video = surface(1_000_000);
        calibrator.submit_video(&mut video);

        // Audio device clock starts near zero
        let mut first = audio(100);
        calibrator.submit_audio(&mut first);
        assert_eq!(first.pts, 1_000_000);

        let mut second = audio(10_100);
        calibrator.submit_audio(&mut second);
        assert_eq!(second.pts, 1_010_000);
    }

    #[test]
    fn test_video_pts_untouched() {
        let mut calibrator = TimestampCalibrator::new();
        let mut video = surface(777);
        calibrator.submit_video(&mut video);
        assert_eq!(video.pts, 777);
    }

    #[test]
    fn test_audio_before_video_learns_on_first_video() {
        let mut calibrator = TimestampCalibrator::new();
        let mut early = audio(50);
        calibrator.submit_audio(&mut early);
        // No video reference yet: pts passes through
        assert_eq!(early.pts, 50);

        let mut video = surface(2_000);
        calibrator.submit_video(&mut video);
        let mut late = audio(150);
        calibrator.submit_audio(&mut late);
        assert_eq!(late.pts, 150 + (2_000 - 50));
    }
}
