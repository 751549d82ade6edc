//! Audio buffers flowing through the pipeline

use bytes::Bytes;

use crate::audio::format::AudioStreamParams;
use crate::utils::Pts;

/// An uncompressed, interleaved audio buffer from capture or conversion
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub params: AudioStreamParams,
    pub pts: Pts,
    pub duration: Pts,
    pub data: Bytes,
}

impl AudioBuffer {
    pub fn sample_frames(&self) -> usize {
        let bpf = self.params.bytes_per_frame();
        if bpf == 0 {
            0
        } else {
            self.data.len() / bpf
        }
    }
}

/// A (possibly compressed) audio buffer ready for per-session fan-out
#[derive(Debug, Clone)]
pub struct TransmittableAudioBuffer {
    pub pts: Pts,
    pub duration: Pts,
    pub sequence: u64,
    pub discontinuity: bool,
    pub data: Bytes,
}
