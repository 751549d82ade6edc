//! Audio converter
//!
//! Resamples, remixes and reformats captured audio into the encoder's
//! accepted parameters. The software implementation covers the common
//! cases (S16/S32/F32, mono/stereo remix, nearest-sample resampling);
//! device-specific resamplers can replace it behind the same trait.

use bytes::Bytes;

use crate::audio::buffer::AudioBuffer;
use crate::audio::format::{AudioStreamParams, SampleFormat};
use crate::error::{Result, StreamError};

pub trait AudioConvertEngine: Send {
    fn init(&mut self, input: AudioStreamParams, output: AudioStreamParams) -> Result<()>;
    fn terminate(&mut self);
    fn convert(&mut self, buffer: &AudioBuffer) -> Result<AudioBuffer>;
    /// Drop resampler state after a timestamp discontinuity
    fn flush(&mut self);
}

pub struct SoftwareAudioConverter {
    setup: Option<(AudioStreamParams, AudioStreamParams)>,
}

impl SoftwareAudioConverter {
    pub fn new() -> Self {
        Self { setup: None }
    }

    fn read_sample(format: SampleFormat, data: &[u8], index: usize) -> f32 {
        match format {
            SampleFormat::S16 => {
                let offset = index * 2;
                let raw = i16::from_le_bytes([data[offset], data[offset + 1]]);
                raw as f32 / i16::MAX as f32
            }
            SampleFormat::S32 => {
                let offset = index * 4;
                let raw = i32::from_le_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                ]);
                raw as f32 / i32::MAX as f32
            }
            SampleFormat::F32 => {
                let offset = index * 4;
                f32::from_le_bytes([
                    data[offset],
                    data[offset + 1],
                    data[offset + 2],
                    data[offset + 3],
                ])
            }
        }
    }

    fn write_sample(format: SampleFormat, out: &mut Vec<u8>, value: f32) {
        let clamped = value.clamp(-1.0, 1.0);
        match format {
            SampleFormat::S16 => {
                out.extend_from_slice(&((clamped * i16::MAX as f32) as i16).to_le_bytes())
            }
            SampleFormat::S32 => {
                out.extend_from_slice(&((clamped * i32::MAX as f32) as i32).to_le_bytes())
            }
            SampleFormat::F32 => out.extend_from_slice(&clamped.to_le_bytes()),
        }
    }
}

impl Default for SoftwareAudioConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioConvertEngine for SoftwareAudioConverter {
    fn init(&mut self, input: AudioStreamParams, output: AudioStreamParams) -> Result<()> {
        if input.channels == 0 || output.channels == 0 {
            return Err(StreamError::InvalidArg(
                "channel count must be non-zero".to_string(),
            ));
        }
        self.setup = Some((input, output));
        Ok(())
    }

    fn terminate(&mut self) {
        self.setup = None;
    }

    fn convert(&mut self, buffer: &AudioBuffer) -> Result<AudioBuffer> {
        let (input, output) = self
            .setup
            .ok_or_else(|| StreamError::NotInitialized("audio converter".to_string()))?;

        let in_frames = buffer.data.len() / input.bytes_per_frame();
        let out_frames =
            (in_frames as u64 * output.sampling_rate as u64 / input.sampling_rate as u64) as usize;

        let mut out =
            Vec::with_capacity(out_frames * output.bytes_per_frame());
        for frame in 0..out_frames {
            // Nearest-sample resampling
            let src_frame = frame * input.sampling_rate as usize / output.sampling_rate as usize;
            let src_frame = src_frame.min(in_frames.saturating_sub(1));
            for channel in 0..output.channels as usize {
                let src_channel = channel.min(input.channels as usize - 1);
                let index = src_frame * input.channels as usize + src_channel;
                let sample = Self::read_sample(input.format, &buffer.data, index);
                Self::write_sample(output.format, &mut out, sample);
            }
        }

        Ok(AudioBuffer {
            params: output,
            pts: buffer.pts,
            duration: buffer.duration,
            data: Bytes::from(out),
        })
    }

    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::ChannelLayout;

    fn make_buffer(params: AudioStreamParams, frames: usize) -> AudioBuffer {
        let mut data = Vec::new();
        for i in 0..frames * params.channels as usize {
            match params.format {
                SampleFormat::S16 => data.extend_from_slice(&((i as i16).wrapping_mul(100)).to_le_bytes()),
                SampleFormat::S32 => data.extend_from_slice(&((i as i32).wrapping_mul(100)).to_le_bytes()),
                SampleFormat::F32 => data.extend_from_slice(&(i as f32 * 0.001).to_le_bytes()),
            }
        }
        AudioBuffer {
            params,
            pts: 0,
            duration: 100_000,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn test_format_conversion_preserves_frame_count() {
        let input = AudioStreamParams::new(48_000, 2, ChannelLayout::STEREO, SampleFormat::S16);
        let output = AudioStreamParams::new(48_000, 2, ChannelLayout::STEREO, SampleFormat::F32);
        let mut converter = SoftwareAudioConverter::new();
        converter.init(input, output).unwrap();

        let converted = converter.convert(&make_buffer(input, 480)).unwrap();
        assert_eq!(converted.sample_frames(), 480);
        assert_eq!(converted.params.format, SampleFormat::F32);
    }

    #[test]
    fn test_downmix_stereo_to_mono() {
        let input = AudioStreamParams::new(48_000, 2, ChannelLayout::STEREO, SampleFormat::F32);
        let output = AudioStreamParams::new(48_000, 1, ChannelLayout::MONO, SampleFormat::F32);
        let mut converter = SoftwareAudioConverter::new();
        converter.init(input, output).unwrap();

        let converted = converter.convert(&make_buffer(input, 100)).unwrap();
        assert_eq!(converted.sample_frames(), 100);
        assert_eq!(converted.params.channels, 1);
    }

    #[test]
    fn test_resample_halves_frames() {
        let input = AudioStreamParams::new(48_000, 1, ChannelLayout::MONO, SampleFormat::F32);
        let output = AudioStreamParams::new(24_000, 1, ChannelLayout::MONO, SampleFormat::F32);
        let mut converter = SoftwareAudioConverter::new();
        converter.init(input, output).unwrap();

        let converted = converter.convert(&make_buffer(input, 480)).unwrap();
        assert_eq!(converted.sample_frames(), 240);
    }

    #[test]
    fn test_convert_before_init_fails() {
        let input = AudioStreamParams::default();
        let mut converter = SoftwareAudioConverter::new();
        let err = converter.convert(&make_buffer(input, 10)).unwrap_err();
        assert!(matches!(err, StreamError::NotInitialized(_)));
    }
}
