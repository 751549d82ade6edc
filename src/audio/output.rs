//! Audio output pipeline
//!
//! Captured buffers enter through a bounded queue and are drained by a pump
//! thread that converts, encodes and fans out. Timestamp discontinuities are
//! detected at submission: the converter and encoder are flushed so the
//! discontinuity flag lands on the buffer that actually follows the gap.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audio::adapter::AudioTransmitterAdapter;
use crate::audio::buffer::{AudioBuffer, TransmittableAudioBuffer};
use crate::audio::convert::AudioConvertEngine;
use crate::audio::encoder::{AudioEncodeEngine, CODEC_ID_PCM};
use crate::audio::format::AudioStreamParams;
use crate::error::{Result, StreamError};
use crate::transport::{InitId, INIT_ID_NONE};
use crate::utils::clock::now_pts;
use crate::utils::queue::BoundedQueue;
use crate::utils::Pts;

/// How long `submit_input` blocks on a saturated queue before `InputFull`
const SUBMIT_TIMEOUT: Duration = Duration::from_millis(100);
/// Pump wakeup interval when idle
const PUMP_POLL: Duration = Duration::from_millis(50);
/// Submission queue depth
const QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct AudioOutputSetup {
    pub input: AudioStreamParams,
    pub output: AudioStreamParams,
    pub bitrate: i64,
}

struct AudioState {
    initialized: bool,
    converter_active: bool,
    codec: String,
    input: AudioStreamParams,
    output: AudioStreamParams,
    sequence: u64,
    expected_pts: Pts,
    discontinuity: bool,
    extradata: Bytes,
    init_id: InitId,
    last_published_init_id: InitId,
}

impl AudioState {
    fn empty() -> Self {
        Self {
            initialized: false,
            converter_active: false,
            codec: String::new(),
            input: AudioStreamParams::default(),
            output: AudioStreamParams::default(),
            sequence: 0,
            expected_pts: 0,
            discontinuity: false,
            extradata: Bytes::new(),
            init_id: INIT_ID_NONE,
            last_published_init_id: INIT_ID_NONE,
        }
    }
}

pub struct AudioOutput {
    adapter: Arc<AudioTransmitterAdapter>,
    guard: Mutex<AudioState>,
    encoder: Mutex<Option<Box<dyn AudioEncodeEngine>>>,
    converter: Mutex<Box<dyn AudioConvertEngine>>,
    queue: BoundedQueue<AudioBuffer>,
    pump_stop: Arc<AtomicBool>,
    pump_thread: Mutex<Option<JoinHandle<()>>>,
}

impl AudioOutput {
    pub fn new(
        adapter: Arc<AudioTransmitterAdapter>,
        encoder: Option<Box<dyn AudioEncodeEngine>>,
        converter: Box<dyn AudioConvertEngine>,
    ) -> Self {
        Self {
            adapter,
            guard: Mutex::new(AudioState::empty()),
            encoder: Mutex::new(encoder),
            converter: Mutex::new(converter),
            queue: BoundedQueue::new(QUEUE_CAPACITY),
            pump_stop: Arc::new(AtomicBool::new(false)),
            pump_thread: Mutex::new(None),
        }
    }

    pub fn init(self: &Arc<Self>, setup: &AudioOutputSetup) -> Result<()> {
        self.terminate();

        let mut actual_output = setup.output;
        let (codec, extradata) = {
            let mut encoder = self.encoder.lock();
            match encoder.as_mut() {
                Some(encoder) => {
                    encoder.init(setup.output, setup.bitrate)?;
                    actual_output = encoder.accepted_params();
                    (
                        encoder.codec_id().to_string(),
                        encoder.extradata().unwrap_or_default(),
                    )
                }
                None => (CODEC_ID_PCM.to_string(), Bytes::new()),
            }
        };

        // A converter is required whenever the captured parameters differ
        // from what leaves the pipeline
        let converter_active = setup.input != actual_output;
        if converter_active {
            self.converter.lock().init(setup.input, actual_output)?;
        }

        {
            let mut state = self.guard.lock();
            state.initialized = true;
            state.converter_active = converter_active;
            state.codec = codec;
            state.input = setup.input;
            state.output = actual_output;
            state.sequence = 0;
            state.expected_pts = 0;
            state.discontinuity = false;
            state.extradata = extradata;
            state.init_id = now_pts();
            state.last_published_init_id = INIT_ID_NONE;
        }

        self.start_pump();
        Ok(())
    }

    /// Stop the pump and reset. Idempotent.
    pub fn terminate(&self) {
        self.pump_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.pump_thread.lock().take() {
            let _ = handle.join();
        }
        self.pump_stop.store(false, Ordering::SeqCst);
        self.queue.clear();

        let mut state = self.guard.lock();
        if state.initialized {
            self.converter.lock().terminate();
            if let Some(encoder) = self.encoder.lock().as_mut() {
                encoder.terminate();
            }
        }
        *state = AudioState::empty();
    }

    /// Submit one captured buffer; blocks up to 100 ms on a full queue.
    pub fn submit_input(&self, buffer: AudioBuffer) -> Result<()> {
        let expected_after = buffer.pts + buffer.duration;
        {
            let mut state = self.guard.lock();
            if !state.initialized {
                return Err(StreamError::NotInitialized(
                    "audio output pipeline".to_string(),
                ));
            }

            if state.expected_pts != 0 && buffer.pts != state.expected_pts {
                // A non-contiguous pts: flag the next emitted buffer and
                // flush so the flag lines up with the gap. The converter
                // also stalls on non-contiguous timestamps otherwise.
                debug!(
                    expected = state.expected_pts,
                    received = buffer.pts,
                    "audio discontinuity detected"
                );
                state.discontinuity = true;
                self.converter.lock().flush();
                if let Some(encoder) = self.encoder.lock().as_mut() {
                    encoder.flush();
                }
            }
        }

        self.queue.push(buffer, SUBMIT_TIMEOUT)?;
        self.guard.lock().expected_pts = expected_after;
        Ok(())
    }

    /// Live bitrate update, forwarded to the encoder.
    pub fn set_bitrate(&self, bitrate: i64) -> Result<()> {
        match self.encoder.lock().as_mut() {
            Some(encoder) => encoder.update_bitrate(bitrate),
            None => Ok(()),
        }
    }

    pub fn current_init_id(&self) -> InitId {
        self.guard.lock().init_id
    }

    fn start_pump(self: &Arc<Self>) {
        let mut handle = self.pump_thread.lock();
        if handle.is_some() {
            return;
        }
        let weak: Weak<AudioOutput> = Arc::downgrade(self);
        let stop = Arc::clone(&self.pump_stop);
        *handle = Some(
            std::thread::Builder::new()
                .name("audio-pump".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let Some(pipeline) = weak.upgrade() else { break };
                        let Some(buffer) = pipeline.queue.pop(PUMP_POLL) else {
                            continue;
                        };
                        pipeline.process_buffer(buffer);
                    }
                })
                .expect("failed to spawn audio pump thread"),
        );
    }

    fn process_buffer(&self, buffer: AudioBuffer) {
        let converter_active = self.guard.lock().converter_active;
        let converted = if converter_active {
            match self.converter.lock().convert(&buffer) {
                Ok(converted) => converted,
                Err(e) => {
                    warn!(error = %e, "audio conversion failed, buffer dropped");
                    return;
                }
            }
        } else {
            buffer
        };

        let has_encoder = self.encoder.lock().is_some();
        if has_encoder {
            // Drain between submits; codecs may produce N outputs per input
            if let Err(e) = self.encode_and_send(&converted) {
                warn!(error = %e, "audio encode failed, buffer dropped");
            }
        } else {
            self.send_buffer(converted.data.clone(), converted.pts, converted.duration);
        }
    }

    fn encode_and_send(&self, buffer: &AudioBuffer) -> Result<()> {
        loop {
            let submitted = {
                let mut encoder = self.encoder.lock();
                match encoder.as_mut() {
                    Some(encoder) => encoder.submit(buffer),
                    None => return Ok(()),
                }
            };

            loop {
                let output = {
                    let mut encoder = self.encoder.lock();
                    match encoder.as_mut() {
                        Some(encoder) => encoder.query_output()?,
                        None => None,
                    }
                };
                match output {
                    Some(encoded) => {
                        self.send_buffer(encoded.data, encoded.pts, encoded.duration)
                    }
                    None => break,
                }
            }

            match submitted {
                Ok(()) => return Ok(()),
                Err(StreamError::InputFull) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => return Err(e),
            }
        }
    }

    fn send_buffer(&self, data: Bytes, pts: Pts, duration: Pts) {
        let (publish, transmittable) = {
            let mut state = self.guard.lock();
            let sequence = state.sequence;
            state.sequence += 1;
            let discontinuity = state.discontinuity;
            state.discontinuity = false;

            let publish = if state.last_published_init_id != state.init_id {
                state.last_published_init_id = state.init_id;
                Some((
                    state.codec.clone(),
                    state.init_id,
                    state.output,
                    state.extradata.clone(),
                ))
            } else {
                None
            };

            (
                publish,
                TransmittableAudioBuffer {
                    pts,
                    duration,
                    sequence,
                    discontinuity,
                    data,
                },
            )
        };

        if let Some((codec, init_id, params, extradata)) = publish {
            if let Err(e) = self.adapter.send_init(&codec, init_id, params, extradata) {
                warn!(error = %e, "failed to broadcast audio init block");
            }
        }

        if let Err(e) = self.adapter.send_buffer(&transmittable) {
            debug!(error = %e, "audio buffer fan-out reported failure");
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.pump_stop.store(true, Ordering::SeqCst);
        self.queue.close();
        if let Some(handle) = self.pump_thread.lock().take() {
            let _ = handle.join();
        }
    }
}
