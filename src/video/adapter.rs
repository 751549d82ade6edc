//! Video transmitter adapter
//!
//! Owns the current init block and the per-session record of which init a
//! session last acknowledged. Frames only flow to sessions whose
//! acknowledgement matches the current init id, which is what keeps a
//! receiver from seeing frames it cannot decode.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::qos::{QosController, VideoOutputStats};
use crate::transport::{
    FrameSink, InitId, SessionHandle, StreamId, VideoStreamDescriptor, INIT_ID_NONE,
};
use crate::video::frame::TransmittableVideoFrame;

#[derive(Default)]
struct SessionInitState {
    /// Init id this session last acknowledged; frames are gated on it
    acked: InitId,
    /// Init id last dispatched to this session
    dispatched: InitId,
}

struct AdapterState {
    codec: String,
    init_id: InitId,
    init_block: Option<Bytes>,
    descriptor: VideoStreamDescriptor,
    sessions: HashMap<SessionHandle, SessionInitState>,
}

/// Fan-out point between the video pipeline and the transport
pub struct VideoTransmitterAdapter {
    transport: Arc<dyn FrameSink>,
    stream_id: StreamId,
    qos: Option<Arc<QosController>>,
    /// When false, dispatching an init is treated as implicit acceptance
    require_ack: bool,
    guard: Mutex<AdapterState>,
}

impl VideoTransmitterAdapter {
    pub fn new(
        transport: Arc<dyn FrameSink>,
        stream_id: StreamId,
        qos: Option<Arc<QosController>>,
    ) -> Self {
        Self {
            transport,
            stream_id,
            qos,
            require_ack: true,
            guard: Mutex::new(AdapterState {
                codec: String::new(),
                init_id: INIT_ID_NONE,
                init_block: None,
                descriptor: VideoStreamDescriptor {
                    resolution: crate::video::format::Resolution::new(0, 0),
                    viewport: crate::video::format::Rect::default(),
                    bit_depth: 8,
                    stereoscopic: false,
                    foveated: false,
                },
                sessions: HashMap::new(),
            }),
        }
    }

    pub fn set_require_ack(&mut self, require_ack: bool) {
        self.require_ack = require_ack;
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn current_init_id(&self) -> InitId {
        self.guard.lock().init_id
    }

    pub fn session_count(&self) -> usize {
        self.guard.lock().sessions.len()
    }

    /// Idempotency signal: a second registration returns `AlreadyExists`.
    pub fn register_session(&self, session: SessionHandle) -> Result<()> {
        let mut state = self.guard.lock();
        if state.sessions.contains_key(&session) {
            return Err(StreamError::AlreadyExists);
        }
        state.sessions.insert(
            session,
            SessionInitState {
                acked: INIT_ID_NONE,
                dispatched: INIT_ID_NONE,
            },
        );
        Ok(())
    }

    pub fn unregister_session(&self, session: SessionHandle) {
        self.guard.lock().sessions.remove(&session);
    }

    /// Record the init id a session acknowledged; frames start flowing to it
    /// once this matches the current init id.
    pub fn update_session(&self, session: SessionHandle, init_id: InitId) {
        let mut state = self.guard.lock();
        match state.sessions.get_mut(&session) {
            Some(entry) => entry.acked = init_id,
            None => warn!(session, "init ack for unregistered session ignored"),
        }
    }

    /// Store a new init block and broadcast it to every registered session.
    pub fn send_init(
        &self,
        codec: &str,
        init_id: InitId,
        descriptor: VideoStreamDescriptor,
        init_block: Bytes,
    ) -> Result<()> {
        let sessions: Vec<SessionHandle> = {
            let mut state = self.guard.lock();
            state.codec = codec.to_string();
            state.init_id = init_id;
            state.init_block = Some(init_block);
            state.descriptor = descriptor;
            state.sessions.keys().copied().collect()
        };

        let mut result = Ok(());
        for session in sessions {
            if let Err(e) = self.send_init_to_session(session) {
                result = Err(e);
            }
        }
        result
    }

    /// Send the current init block to one session.
    pub fn send_init_to_session(&self, session: SessionHandle) -> Result<()> {
        let (codec, init_id, descriptor, block) = {
            let mut state = self.guard.lock();
            if state.init_id == INIT_ID_NONE {
                return Ok(());
            }
            let block = match &state.init_block {
                Some(block) => block.clone(),
                None => return Ok(()),
            };
            let init_id = state.init_id;
            if let Some(entry) = state.sessions.get_mut(&session) {
                entry.dispatched = init_id;
                if !self.require_ack {
                    entry.acked = init_id;
                }
            }
            (state.codec.clone(), init_id, state.descriptor, block)
        };
        self.transport
            .send_video_init(session, &codec, self.stream_id, init_id, &descriptor, &block)
    }

    /// Fan a compressed frame out to every session whose ack is current,
    /// then feed the observables into QoS.
    pub fn send_frame(
        &self,
        frame: &TransmittableVideoFrame,
        stats: VideoOutputStats,
    ) -> Result<()> {
        let (targets, init_id) = {
            let state = self.guard.lock();
            let targets: Vec<SessionHandle> = state
                .sessions
                .iter()
                .filter(|(_, s)| s.acked == state.init_id)
                .map(|(h, _)| *h)
                .collect();
            (targets, state.init_id)
        };

        let mut result = Ok(());
        if init_id != INIT_ID_NONE {
            for session in targets {
                if let Err(e) = self.transport.send_video_frame(session, self.stream_id, frame) {
                    debug!(session, error = %e, "video frame send failed");
                    result = Err(e);
                }
            }
        }

        if let Some(qos) = &self.qos {
            qos.adjust_stream_quality(stats);
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::buffer::TransmittableAudioBuffer;
    use crate::audio::format::AudioStreamParams;
    use crate::video::format::{Rect, Resolution};
    use crate::video::frame::{SubframeType, ViewType};

    /// Transport double recording every send
    #[derive(Default)]
    pub struct RecordingSink {
        pub video_inits: Mutex<Vec<(SessionHandle, InitId, Bytes)>>,
        pub video_frames: Mutex<Vec<(SessionHandle, u64)>>,
        pub audio_inits: Mutex<Vec<(SessionHandle, InitId)>>,
        pub audio_buffers: Mutex<Vec<(SessionHandle, u64, bool)>>,
    }

    impl FrameSink for RecordingSink {
        fn send_video_init(
            &self,
            session: SessionHandle,
            _codec: &str,
            _stream_id: StreamId,
            init_id: InitId,
            _descriptor: &VideoStreamDescriptor,
            init_block: &[u8],
        ) -> Result<()> {
            self.video_inits
                .lock()
                .push((session, init_id, Bytes::copy_from_slice(init_block)));
            Ok(())
        }

        fn send_video_frame(
            &self,
            session: SessionHandle,
            _stream_id: StreamId,
            frame: &TransmittableVideoFrame,
        ) -> Result<()> {
            self.video_frames.lock().push((session, frame.sequence()));
            Ok(())
        }

        fn send_audio_init(
            &self,
            session: SessionHandle,
            _codec: &str,
            _stream_id: StreamId,
            init_id: InitId,
            _params: &AudioStreamParams,
            _init_block: &[u8],
        ) -> Result<()> {
            self.audio_inits.lock().push((session, init_id));
            Ok(())
        }

        fn send_audio_buffer(
            &self,
            session: SessionHandle,
            _stream_id: StreamId,
            buffer: &TransmittableAudioBuffer,
        ) -> Result<()> {
            self.audio_buffers
                .lock()
                .push((session, buffer.sequence, buffer.discontinuity));
            Ok(())
        }
    }

    fn descriptor() -> VideoStreamDescriptor {
        VideoStreamDescriptor {
            resolution: Resolution::HD1080,
            viewport: Rect::new(0, 0, 1920, 1080),
            bit_depth: 8,
            stereoscopic: false,
            foveated: false,
        }
    }

    fn frame(sequence: u64) -> TransmittableVideoFrame {
        let mut f = TransmittableVideoFrame::new(ViewType::Monoscopic, 0, 1000, 100, sequence, false);
        f.add_subframe(SubframeType::Idr, Bytes::from_static(&[1, 2, 3]), 1000, 100)
            .unwrap();
        f
    }

    #[test]
    fn test_duplicate_registration_reports_already_exists() {
        let sink = Arc::new(RecordingSink::default());
        let adapter = VideoTransmitterAdapter::new(sink, 0, None);
        adapter.register_session(1).unwrap();
        assert!(matches!(
            adapter.register_session(1),
            Err(StreamError::AlreadyExists)
        ));
    }

    #[test]
    fn test_frames_withheld_until_ack() {
        let sink = Arc::new(RecordingSink::default());
        let adapter = VideoTransmitterAdapter::new(Arc::clone(&sink) as Arc<dyn FrameSink>, 0, None);
        adapter.register_session(1).unwrap();
        adapter
            .send_init("h264", 100, descriptor(), Bytes::from_static(b"sps"))
            .unwrap();

        adapter.send_frame(&frame(0), VideoOutputStats::default()).unwrap();
        assert!(sink.video_frames.lock().is_empty());

        adapter.update_session(1, 100);
        adapter.send_frame(&frame(1), VideoOutputStats::default()).unwrap();
        assert_eq!(sink.video_frames.lock().as_slice(), &[(1, 1)]);
    }

    #[test]
    fn test_stale_ack_stops_frames_after_reinit() {
        let sink = Arc::new(RecordingSink::default());
        let adapter = VideoTransmitterAdapter::new(Arc::clone(&sink) as Arc<dyn FrameSink>, 0, None);
        adapter.register_session(1).unwrap();
        adapter
            .send_init("h264", 100, descriptor(), Bytes::from_static(b"sps"))
            .unwrap();
        adapter.update_session(1, 100);

        // Codec reinit bumps the id; the old ack no longer qualifies
        adapter
            .send_init("h264", 200, descriptor(), Bytes::from_static(b"sps2"))
            .unwrap();
        adapter.send_frame(&frame(5), VideoOutputStats::default()).unwrap();
        assert!(sink.video_frames.lock().is_empty());

        adapter.update_session(1, 200);
        adapter.send_frame(&frame(6), VideoOutputStats::default()).unwrap();
        assert_eq!(sink.video_frames.lock().as_slice(), &[(1, 6)]);
    }

    #[test]
    fn test_init_broadcast_reaches_all_sessions() {
        let sink = Arc::new(RecordingSink::default());
        let adapter = VideoTransmitterAdapter::new(Arc::clone(&sink) as Arc<dyn FrameSink>, 0, None);
        adapter.register_session(1).unwrap();
        adapter.register_session(2).unwrap();
        adapter
            .send_init("h264", 100, descriptor(), Bytes::from_static(b"sps"))
            .unwrap();
        let inits = sink.video_inits.lock();
        let mut sessions: Vec<_> = inits.iter().map(|(s, _, _)| *s).collect();
        sessions.sort_unstable();
        assert_eq!(sessions, vec![1, 2]);
    }

    #[test]
    fn test_unregister_restores_pre_registration_state() {
        let sink = Arc::new(RecordingSink::default());
        let adapter = VideoTransmitterAdapter::new(sink, 0, None);
        adapter
            .send_init("h264", 100, descriptor(), Bytes::from_static(b"sps"))
            .unwrap();
        let before = adapter.current_init_id();

        adapter.register_session(7).unwrap();
        adapter.update_session(7, 100);
        adapter.unregister_session(7);

        assert_eq!(adapter.current_init_id(), before);
        assert_eq!(adapter.session_count(), 0);
        // Registration works again after the round trip
        adapter.register_session(7).unwrap();
    }

    #[test]
    fn test_no_init_no_frames() {
        let sink = Arc::new(RecordingSink::default());
        let adapter = VideoTransmitterAdapter::new(Arc::clone(&sink) as Arc<dyn FrameSink>, 0, None);
        adapter.register_session(1).unwrap();
        adapter.send_init_to_session(1).unwrap();
        assert!(sink.video_inits.lock().is_empty());
        adapter.send_frame(&frame(0), VideoOutputStats::default()).unwrap();
        assert!(sink.video_frames.lock().is_empty());
    }
}
