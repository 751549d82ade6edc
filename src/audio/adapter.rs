//! Audio transmitter adapter
//!
//! Same init-gating contract as the video adapter: a session receives audio
//! buffers only after acknowledging the init id they were encoded under.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::audio::buffer::TransmittableAudioBuffer;
use crate::audio::format::AudioStreamParams;
use crate::error::{Result, StreamError};
use crate::transport::{FrameSink, InitId, SessionHandle, StreamId, INIT_ID_NONE};

#[derive(Default)]
struct SessionInitState {
    acked: InitId,
    dispatched: InitId,
}

struct AdapterState {
    codec: String,
    init_id: InitId,
    init_block: Option<Bytes>,
    params: AudioStreamParams,
    sessions: HashMap<SessionHandle, SessionInitState>,
}

pub struct AudioTransmitterAdapter {
    transport: Arc<dyn FrameSink>,
    stream_id: StreamId,
    require_ack: bool,
    guard: Mutex<AdapterState>,
}

impl AudioTransmitterAdapter {
    pub fn new(transport: Arc<dyn FrameSink>, stream_id: StreamId) -> Self {
        Self {
            transport,
            stream_id,
            require_ack: true,
            guard: Mutex::new(AdapterState {
                codec: String::new(),
                init_id: INIT_ID_NONE,
                init_block: None,
                params: AudioStreamParams::default(),
                sessions: HashMap::new(),
            }),
        }
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

    pub fn update_session(&self, session: SessionHandle, init_id: InitId) {
        let mut state = self.guard.lock();
        match state.sessions.get_mut(&session) {
            Some(entry) => entry.acked = init_id,
            None => warn!(session, "audio init ack for unregistered session ignored"),
        }
    }

    /// Store a new init block and broadcast it to every registered session.
    /// The init block may be empty (PCM has no extradata).
    pub fn send_init(
        &self,
        codec: &str,
        init_id: InitId,
        params: AudioStreamParams,
        init_block: Bytes,
    ) -> Result<()> {
        let sessions: Vec<SessionHandle> = {
            let mut state = self.guard.lock();
            state.codec = codec.to_string();
            state.init_id = init_id;
            state.init_block = Some(init_block);
            state.params = params;
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

    pub fn send_init_to_session(&self, session: SessionHandle) -> Result<()> {
        let (codec, init_id, params, block) = {
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
            (state.codec.clone(), init_id, state.params, block)
        };
        self.transport
            .send_audio_init(session, &codec, self.stream_id, init_id, &params, &block)
    }

    pub fn send_buffer(&self, buffer: &TransmittableAudioBuffer) -> Result<()> {
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
                if let Err(e) = self
                    .transport
                    .send_audio_buffer(session, self.stream_id, buffer)
                {
                    debug!(session, error = %e, "audio buffer send failed");
                    result = Err(e);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::adapter::tests::RecordingSink;

    fn buffer(sequence: u64) -> TransmittableAudioBuffer {
        TransmittableAudioBuffer {
            pts: sequence as i64 * 100_000,
            duration: 100_000,
            sequence,
            discontinuity: false,
            data: Bytes::from_static(&[1, 2, 3]),
        }
    }

    #[test]
    fn test_buffers_gated_on_ack() {
        let sink = Arc::new(RecordingSink::default());
        let adapter = AudioTransmitterAdapter::new(Arc::clone(&sink) as Arc<dyn FrameSink>, 0);
        adapter.register_session(1).unwrap();
        adapter
            .send_init("aac", 10, AudioStreamParams::default(), Bytes::from_static(b"cfg"))
            .unwrap();

        adapter.send_buffer(&buffer(0)).unwrap();
        assert!(sink.audio_buffers.lock().is_empty());

        adapter.update_session(1, 10);
        adapter.send_buffer(&buffer(1)).unwrap();
        assert_eq!(sink.audio_buffers.lock().as_slice(), &[(1, 1, false)]);
    }

    #[test]
    fn test_duplicate_registration() {
        let sink = Arc::new(RecordingSink::default());
        let adapter = AudioTransmitterAdapter::new(sink, 0);
        adapter.register_session(4).unwrap();
        assert!(matches!(
            adapter.register_session(4),
            Err(StreamError::AlreadyExists)
        ));
        adapter.unregister_session(4);
        adapter.register_session(4).unwrap();
    }

    #[test]
    fn test_init_broadcast() {
        let sink = Arc::new(RecordingSink::default());
        let adapter = AudioTransmitterAdapter::new(Arc::clone(&sink) as Arc<dyn FrameSink>, 0);
        adapter.register_session(1).unwrap();
        adapter.register_session(2).unwrap();
        adapter
            .send_init("aac", 11, AudioStreamParams::default(), Bytes::new())
            .unwrap();
        assert_eq!(sink.audio_inits.lock().len(), 2);
    }
}
