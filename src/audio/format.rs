//! Audio sample formats and stream parameters

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample encoding of uncompressed audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    S16,
    S32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 => 4,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            SampleFormat::S16 => 0,
            SampleFormat::S32 => 1,
            SampleFormat::F32 => 2,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(SampleFormat::S16),
            1 => Some(SampleFormat::S32),
            2 => Some(SampleFormat::F32),
            _ => None,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SampleFormat::S16 => "S16",
            SampleFormat::S32 => "S32",
            SampleFormat::F32 => "F32",
        };
        f.write_str(s)
    }
}

/// Speaker layout as a channel-position bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelLayout(pub u32);

impl ChannelLayout {
    pub const MONO: ChannelLayout = ChannelLayout(0x1);
    pub const STEREO: ChannelLayout = ChannelLayout(0x3);
    pub const SURROUND_5_1: ChannelLayout = ChannelLayout(0x3F);

    pub fn channels(self) -> u32 {
        self.0.count_ones()
    }

    pub fn default_for_channels(channels: u32) -> Self {
        match channels {
            1 => Self::MONO,
            2 => Self::STEREO,
            6 => Self::SURROUND_5_1,
            n => ChannelLayout((1u32 << n.min(31)) - 1),
        }
    }
}

/// Format of one side (input or output) of the audio pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStreamParams {
    pub sampling_rate: u32,
    pub channels: u32,
    pub layout: ChannelLayout,
    pub format: SampleFormat,
}

impl AudioStreamParams {
    pub fn new(sampling_rate: u32, channels: u32, layout: ChannelLayout, format: SampleFormat) -> Self {
        Self {
            sampling_rate,
            channels,
            layout,
            format,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }
}

impl Default for AudioStreamParams {
    fn default() -> Self {
        Self {
            sampling_rate: 48_000,
            channels: 2,
            layout: ChannelLayout::STEREO,
            format: SampleFormat::F32,
        }
    }
}
