//! Synthetic capture sources
//!
//! A moving-gradient video source and a sine-tone audio source, paced in
//! real time. They keep the full pipeline runnable on machines without
//! capture hardware and give the integration tests deterministic input.

use bytes::Bytes;
use std::time::{Duration, Instant};

use crate::audio::buffer::AudioBuffer;
use crate::audio::format::AudioStreamParams;
use crate::capture::{AudioCaptureSource, VideoCaptureSource};
use crate::error::Result;
use crate::utils::clock::{now_pts, secs_to_pts};
use crate::video::format::{ColorInfo, Resolution, Rotation, SurfaceFormat};
use crate::video::frame::VideoSurface;

pub struct SyntheticVideoSource {
    resolution: Resolution,
    framerate: f32,
    next_due: Instant,
    frame_index: u64,
}

impl SyntheticVideoSource {
    pub fn new(resolution: Resolution, framerate: f32) -> Self {
        Self {
            resolution,
            framerate: framerate.max(1.0),
            next_due: Instant::now(),
            frame_index: 0,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.framerate)
    }

    fn render(&self) -> Bytes {
        let width = self.resolution.width as usize;
        let height = self.resolution.height as usize;
        let phase = (self.frame_index % 256) as u8;
        let mut data = vec![0u8; width * height];
        for (y, row) in data.chunks_mut(width).enumerate() {
            for (x, px) in row.iter_mut().enumerate() {
                *px = ((x + y) as u8).wrapping_add(phase);
            }
        }
        Bytes::from(data)
    }
}

impl VideoCaptureSource for SyntheticVideoSource {
    fn take_sample(&mut self) -> Result<Option<VideoSurface>> {
        let now = Instant::now();
        if now < self.next_due {
            return Ok(None);
        }
        self.next_due = now + self.frame_interval();

        let pts = now_pts();
        let surface = VideoSurface {
            resolution: self.resolution,
            format: SurfaceFormat::Nv12,
            color: ColorInfo::default(),
            rotation: Rotation::None,
            dcc: false,
            srgb_view: false,
            origin_pts: pts,
            pts,
            duration: secs_to_pts(1.0 / self.framerate),
            data: self.render(),
        };
        self.frame_index += 1;
        Ok(Some(surface))
    }

    fn set_framerate(&mut self, framerate: f32) {
        self.framerate = framerate.max(1.0);
    }
}

pub struct SyntheticAudioSource {
    params: AudioStreamParams,
    chunk: Duration,
    next_due: Instant,
    sample_index: u64,
    tone_hz: f32,
}

impl SyntheticAudioSource {
    pub fn new(params: AudioStreamParams) -> Self {
        Self {
            params,
            chunk: Duration::from_millis(10),
            next_due: Instant::now(),
            sample_index: 0,
            tone_hz: 440.0,
        }
    }

    fn render(&mut self, frames: usize) -> Bytes {
        let mut data = Vec::with_capacity(frames * self.params.bytes_per_frame());
        for _ in 0..frames {
            let t = self.sample_index as f32 / self.params.sampling_rate as f32;
            let sample = (t * self.tone_hz * std::f32::consts::TAU).sin() * 0.25;
            self.sample_index += 1;
            for _ in 0..self.params.channels {
                match self.params.format {
                    crate::audio::format::SampleFormat::S16 => {
                        data.extend_from_slice(&((sample * i16::MAX as f32) as i16).to_le_bytes())
                    }
                    crate::audio::format::SampleFormat::S32 => {
                        data.extend_from_slice(&((sample * i32::MAX as f32) as i32).to_le_bytes())
                    }
                    crate::audio::format::SampleFormat::F32 => {
                        data.extend_from_slice(&sample.to_le_bytes())
                    }
                }
            }
        }
        Bytes::from(data)
    }
}

impl AudioCaptureSource for SyntheticAudioSource {
    fn take_sample(&mut self) -> Result<Option<AudioBuffer>> {
        let now = Instant::now();
        if now < self.next_due {
            return Ok(None);
        }
        self.next_due = now + self.chunk;

        let frames = (self.params.sampling_rate as u64 * self.chunk.as_millis() as u64 / 1000) as usize;
        let pts = now_pts();
        let buffer = AudioBuffer {
            params: self.params,
            pts,
            duration: secs_to_pts(self.chunk.as_secs_f32()),
            data: self.render(frames),
        };
        Ok(Some(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_source_paces_frames() {
        let mut source = SyntheticVideoSource::new(Resolution::new(64, 36), 100.0);
        let first = source.take_sample().unwrap();
        assert!(first.is_some());
        // Immediately after producing a frame the source is not due yet
        let second = source.take_sample().unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_video_frame_has_expected_size() {
        let mut source = SyntheticVideoSource::new(Resolution::new(64, 36), 100.0);
        let surface = source.take_sample().unwrap().unwrap();
        assert_eq!(surface.data.len(), 64 * 36);
        assert_eq!(surface.resolution, Resolution::new(64, 36));
    }

    #[test]
    fn test_audio_source_produces_chunks() {
        let mut source = SyntheticAudioSource::new(AudioStreamParams::default());
        let buffer = source.take_sample().unwrap().unwrap();
        // 10 ms at 48 kHz stereo F32
        assert_eq!(buffer.sample_frames(), 480);
    }
}
