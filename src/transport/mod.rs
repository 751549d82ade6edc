//! Transport layer
//!
//! Common identifiers, the narrow callback traits the server transport and
//! the pipelines communicate through, and the concrete server/client
//! transports. Callbacks carry only the operations their consumer needs so
//! no component holds a strong reference back up the ownership tree.

pub mod cipher;
pub mod client;
pub mod server;
pub mod session;

use crate::audio::buffer::TransmittableAudioBuffer;
use crate::audio::format::AudioStreamParams;
use crate::utils::Pts;
use crate::video::format::{Rect, Resolution};
use crate::video::frame::TransmittableVideoFrame;

/// Opaque 64-bit handle tied to one connected peer
pub type SessionHandle = i64;

/// Identifier of a stream within a session
pub type StreamId = i64;

/// Monotonically increasing identifier of a codec init block
pub type InitId = i64;

/// The only stream id this server serves; non-default ids are rejected at
/// the subscribe boundary.
pub const DEFAULT_STREAM: StreamId = 0;

/// Init id sentinel meaning "no init block published yet"
pub const INIT_ID_NONE: InitId = -1;

/// Negotiated role of a connected peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Viewer,
    Controller,
}

/// Why a session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Graceful disconnect requested by the peer
    Disconnect,
    /// No inbound traffic within the configured idle period
    Timeout,
}

/// Geometry metadata accompanying a video init block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoStreamDescriptor {
    pub resolution: Resolution,
    pub viewport: Rect,
    pub bit_depth: u32,
    pub stereoscopic: bool,
    pub foveated: bool,
}

/// Per-session receiver statistics uploaded over the service channel
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverStats {
    pub full_latency: f32,
    pub client_latency: f32,
    pub server_latency: f32,
    pub encoder_latency: f32,
    pub network_latency: f32,
    pub decoder_latency: f32,
    pub receiver_framerate: f32,
    pub decoder_queue_depth: i64,
    pub key_frame_req_count: i64,
    pub worst_send_time: f32,
    pub last_stats_time: Pts,
}

/// Send surface the transmitter adapters use. Implemented by the server
/// transport; mocked in adapter and pipeline tests.
pub trait FrameSink: Send + Sync {
    fn send_video_init(
        &self,
        session: SessionHandle,
        codec: &str,
        stream_id: StreamId,
        init_id: InitId,
        descriptor: &VideoStreamDescriptor,
        init_block: &[u8],
    ) -> crate::error::Result<()>;

    fn send_video_frame(
        &self,
        session: SessionHandle,
        stream_id: StreamId,
        frame: &TransmittableVideoFrame,
    ) -> crate::error::Result<()>;

    fn send_audio_init(
        &self,
        session: SessionHandle,
        codec: &str,
        stream_id: StreamId,
        init_id: InitId,
        params: &AudioStreamParams,
        init_block: &[u8],
    ) -> crate::error::Result<()>;

    fn send_audio_buffer(
        &self,
        session: SessionHandle,
        stream_id: StreamId,
        buffer: &TransmittableAudioBuffer,
    ) -> crate::error::Result<()>;
}

/// Video-side transport events, delivered to the orchestrator
pub trait VideoSenderCallback: Send + Sync {
    fn on_video_stream_subscribed(&self, session: SessionHandle, stream_id: StreamId);
    fn on_video_stream_unsubscribed(&self, session: SessionHandle, stream_id: StreamId);
    /// The client acked (or nacked, `init_id < 0`) a video init block.
    fn on_ready_to_receive_video(&self, session: SessionHandle, stream_id: StreamId, init_id: InitId);
    fn on_force_update_request(&self, stream_id: StreamId);
    fn on_video_request_init(&self, session: SessionHandle, stream_id: StreamId);
    fn on_bitrate_change_request(&self, session: SessionHandle, stream_id: StreamId, bitrate: i64);
    fn on_framerate_change_request(&self, session: SessionHandle, stream_id: StreamId, framerate: f32);
    fn on_resolution_change_request(
        &self,
        session: SessionHandle,
        stream_id: StreamId,
        resolution: Resolution,
    );
}

/// Audio-side transport events, delivered to the orchestrator
pub trait AudioSenderCallback: Send + Sync {
    fn on_audio_stream_subscribed(&self, session: SessionHandle, stream_id: StreamId);
    fn on_audio_stream_unsubscribed(&self, session: SessionHandle, stream_id: StreamId);
    fn on_ready_to_receive_audio(&self, session: SessionHandle, stream_id: StreamId, init_id: InitId);
    fn on_audio_request_init(&self, session: SessionHandle, stream_id: StreamId);
}

/// Statistics uploads, delivered to the orchestrator
pub trait StatsCallback: Send + Sync {
    fn on_receiver_stats(&self, session: SessionHandle, stream_id: StreamId, stats: &ReceiverStats);
    fn on_origin_pts(&self, session: SessionHandle, stream_id: StreamId, origin_pts: Pts);
}

/// Admission and lifecycle decisions, owned by the top-level server
pub trait ConnectionManagerCallback: Send + Sync {
    /// Accept or refuse a discovery request. Refusals still produce a reply.
    fn on_discovery_request(&self, subscriber_count: usize) -> bool;
    /// Accept or refuse a connection with the requested role.
    fn on_connection_request(&self, session: SessionHandle, role: ClientRole) -> bool;
    fn on_session_terminated(&self, session: SessionHandle, reason: TerminationReason);
}
