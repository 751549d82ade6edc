//! Capture source boundary
//!
//! Display and audio capture are driver integrations living outside this
//! crate. Sources are polled with a non-blocking `take_sample`; an empty
//! return means "nothing yet" and the capture thread yields briefly instead
//! of spinning.

pub mod synthetic;

use crate::audio::buffer::AudioBuffer;
use crate::error::Result;
use crate::video::frame::VideoSurface;

pub trait VideoCaptureSource: Send {
    /// Grab the next captured surface if one is ready.
    fn take_sample(&mut self) -> Result<Option<VideoSurface>>;

    /// Align the capture cadence with the encoder's framerate.
    fn set_framerate(&mut self, framerate: f32);
}

pub trait AudioCaptureSource: Send {
    /// Grab the next captured buffer if one is ready.
    fn take_sample(&mut self) -> Result<Option<AudioBuffer>>;
}

pub use synthetic::{SyntheticAudioSource, SyntheticVideoSource};
