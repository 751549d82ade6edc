//! Audio encode engine boundary
//!
//! AAC/Opus encoders live behind [`AudioEncodeEngine`]. Codecs may produce
//! N output buffers for M inputs, so the pipeline drains `query_output`
//! between submits. When no engine is configured the pipeline ships PCM.

use bytes::Bytes;
use std::collections::VecDeque;

use crate::audio::buffer::AudioBuffer;
use crate::audio::format::AudioStreamParams;
use crate::error::{Result, StreamError};
use crate::utils::Pts;

/// Codec id used when shipping uncompressed audio
pub const CODEC_ID_PCM: &str = "pcm";

/// One encoded audio buffer
#[derive(Debug, Clone)]
pub struct EncodedAudio {
    pub data: Bytes,
    pub pts: Pts,
    pub duration: Pts,
}

pub trait AudioEncodeEngine: Send {
    fn codec_id(&self) -> &str;

    fn init(&mut self, output: AudioStreamParams, bitrate: i64) -> Result<()>;
    fn terminate(&mut self);

    /// Codec extradata for the init block, refreshed by `init`
    fn extradata(&self) -> Option<Bytes>;

    /// Format this engine ingests; the pipeline converts to it
    fn accepted_params(&self) -> AudioStreamParams;

    fn submit(&mut self, buffer: &AudioBuffer) -> Result<()>;
    fn query_output(&mut self) -> Result<Option<EncodedAudio>>;

    fn update_bitrate(&mut self, bitrate: i64) -> Result<()>;

    /// Drop internal state after a timestamp discontinuity
    fn flush(&mut self);
}

/// 1:1 passthrough engine for development and tests: frames PCM input as
/// "compressed" buffers under a fake codec id.
pub struct LoopbackAudioEncoder {
    params: AudioStreamParams,
    bitrate: i64,
    initialized: bool,
    queue: VecDeque<EncodedAudio>,
}

impl LoopbackAudioEncoder {
    pub const CODEC_ID: &'static str = "loopback-audio";

    pub fn new(params: AudioStreamParams) -> Self {
        Self {
            params,
            bitrate: 0,
            initialized: false,
            queue: VecDeque::new(),
        }
    }
}

impl AudioEncodeEngine for LoopbackAudioEncoder {
    fn codec_id(&self) -> &str {
        Self::CODEC_ID
    }

    fn init(&mut self, output: AudioStreamParams, bitrate: i64) -> Result<()> {
        self.params = output;
        self.bitrate = bitrate;
        self.initialized = true;
        self.queue.clear();
        Ok(())
    }

    fn terminate(&mut self) {
        self.initialized = false;
        self.queue.clear();
    }

    fn extradata(&self) -> Option<Bytes> {
        if self.initialized {
            let mut header = Vec::with_capacity(12);
            header.extend_from_slice(b"LBKA");
            header.extend_from_slice(&self.params.sampling_rate.to_be_bytes());
            header.extend_from_slice(&self.params.channels.to_be_bytes());
            Some(Bytes::from(header))
        } else {
            None
        }
    }

    fn accepted_params(&self) -> AudioStreamParams {
        self.params
    }

    fn submit(&mut self, buffer: &AudioBuffer) -> Result<()> {
        if !self.initialized {
            return Err(StreamError::NotInitialized("audio encoder".to_string()));
        }
        self.queue.push_back(EncodedAudio {
            data: buffer.data.clone(),
            pts: buffer.pts,
            duration: buffer.duration,
        });
        Ok(())
    }

    fn query_output(&mut self) -> Result<Option<EncodedAudio>> {
        Ok(self.queue.pop_front())
    }

    fn update_bitrate(&mut self, bitrate: i64) -> Result<()> {
        if !self.initialized {
            return Err(StreamError::NotInitialized("audio encoder".to_string()));
        }
        self.bitrate = bitrate;
        Ok(())
    }

    fn flush(&mut self) {
        self.queue.clear();
    }
}
