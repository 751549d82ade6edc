//! Audio pipeline: formats, buffers, the encode/convert engine boundaries,
//! the output pipeline and the transmitter adapter.

pub mod adapter;
pub mod buffer;
pub mod convert;
pub mod encoder;
pub mod format;
pub mod output;

pub use adapter::AudioTransmitterAdapter;
pub use buffer::{AudioBuffer, TransmittableAudioBuffer};
pub use format::{AudioStreamParams, ChannelLayout, SampleFormat};
pub use output::{AudioOutput, AudioOutputSetup};
