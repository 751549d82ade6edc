//! Video pipeline: formats, frames, the encode/convert engine boundaries,
//! the monoscopic output pipeline and the transmit/receive adapters.

pub mod adapter;
pub mod assembler;
pub mod convert;
pub mod cursor;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod output;

pub use adapter::VideoTransmitterAdapter;
pub use assembler::VideoStreamAssembler;
pub use format::{Rect, Resolution, SurfaceFormat};
pub use frame::{SubframeType, TransmittableVideoFrame, VideoSurface, ViewType};
pub use output::{MonoscopicVideoOutput, VideoOutputSetup};
