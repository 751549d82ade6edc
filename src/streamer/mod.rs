//! AV streamer orchestrator
//!
//! Owns the two capture threads and wires transport events into the video
//! and audio pipelines. Capture for a media kind starts with its first
//! subscriber and stops (thread joined) with its last. The orchestrator is
//! also the QoS listener, translating control-loop events into encoder
//! updates.
//!
//! Locking: the orchestrator guard is the outermost lock in the system.
//! Component handles are cloned out of it before calling into pipelines or
//! QoS, never while holding it.

pub mod calibrator;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::capture::{AudioCaptureSource, VideoCaptureSource};
use crate::error::StreamError;
use crate::qos::{QosController, QosEvent, QosListener};
use crate::utils::LogThrottler;
use crate::warn_throttled;
use crate::transport::{
    AudioSenderCallback, InitId, ReceiverStats, SessionHandle, StatsCallback, StreamId,
    VideoSenderCallback, DEFAULT_STREAM,
};
use crate::utils::clock::{now_pts, Pts};
use crate::video::format::Resolution;
use crate::video::output::MonoscopicVideoOutput;
use crate::video::VideoTransmitterAdapter;
use crate::audio::{AudioOutput, AudioTransmitterAdapter};
use calibrator::TimestampCalibrator;

/// Escalation hook for unrecoverable pipeline failures. A capture-source
/// failure is fatal for the whole server instance: the implementor must
/// stop both capture threads and terminate every session.
pub trait FatalErrorSink: Send + Sync {
    fn on_capture_failure(&self, source: &str, error: &StreamError);
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl CaptureWorker {
    fn stop_and_join(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

struct Inner {
    video_capture: Option<Arc<Mutex<Box<dyn VideoCaptureSource>>>>,
    video_output: Option<Arc<MonoscopicVideoOutput>>,
    video_adapter: Option<Arc<VideoTransmitterAdapter>>,
    audio_capture: Option<Arc<Mutex<Box<dyn AudioCaptureSource>>>>,
    audio_output: Option<Arc<AudioOutput>>,
    audio_adapter: Option<Arc<AudioTransmitterAdapter>>,
    qos: Option<Arc<QosController>>,
    sessions_video: HashSet<SessionHandle>,
    sessions_audio: HashSet<SessionHandle>,
    last_origin_pts: Pts,
    time_of_last_origin_pts: Pts,
}

pub struct AvStreamer {
    guard: Mutex<Inner>,
    calibrator: Arc<Mutex<TimestampCalibrator>>,
    video_worker: Mutex<Option<CaptureWorker>>,
    audio_worker: Mutex<Option<CaptureWorker>>,
    throttler: Arc<LogThrottler>,
    fatal_sink: Mutex<Option<Weak<dyn FatalErrorSink>>>,
}

impl AvStreamer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            guard: Mutex::new(Inner {
                video_capture: None,
                video_output: None,
                video_adapter: None,
                audio_capture: None,
                audio_output: None,
                audio_adapter: None,
                qos: None,
                sessions_video: HashSet::new(),
                sessions_audio: HashSet::new(),
                last_origin_pts: 0,
                time_of_last_origin_pts: 0,
            }),
            calibrator: Arc::new(Mutex::new(TimestampCalibrator::new())),
            video_worker: Mutex::new(None),
            audio_worker: Mutex::new(None),
            throttler: Arc::new(LogThrottler::default()),
            fatal_sink: Mutex::new(None),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &self,
        video_capture: Box<dyn VideoCaptureSource>,
        video_output: Arc<MonoscopicVideoOutput>,
        video_adapter: Arc<VideoTransmitterAdapter>,
        audio_capture: Box<dyn AudioCaptureSource>,
        audio_output: Arc<AudioOutput>,
        audio_adapter: Arc<AudioTransmitterAdapter>,
        qos: Arc<QosController>,
    ) {
        let mut inner = self.guard.lock();
        inner.video_capture = Some(Arc::new(Mutex::new(video_capture)));
        inner.video_output = Some(video_output);
        inner.video_adapter = Some(video_adapter);
        inner.audio_capture = Some(Arc::new(Mutex::new(audio_capture)));
        inner.audio_output = Some(audio_output);
        inner.audio_adapter = Some(audio_adapter);
        inner.qos = Some(qos);
    }

    /// Register the escalation hook for unrecoverable capture failures.
    pub fn set_fatal_error_sink(&self, sink: Weak<dyn FatalErrorSink>) {
        *self.fatal_sink.lock() = Some(sink);
    }

    /// Stop capture and release components. Idempotent.
    pub fn terminate(&self) {
        if let Some(worker) = self.video_worker.lock().take() {
            worker.stop_and_join();
        }
        if let Some(worker) = self.audio_worker.lock().take() {
            worker.stop_and_join();
        }

        let mut inner = self.guard.lock();
        inner.audio_adapter = None;
        inner.audio_output = None;
        inner.audio_capture = None;
        inner.video_adapter = None;
        inner.video_output = None;
        inner.video_capture = None;
        inner.qos = None;
        inner.sessions_video.clear();
        inner.sessions_audio.clear();
    }

    /// Full cleanup for a departed session, from either disconnect path.
    pub fn on_session_disconnected(&self, session: SessionHandle) {
        let qos = {
            let mut inner = self.guard.lock();
            inner.sessions_video.remove(&session);
            inner.sessions_audio.remove(&session);
            if let Some(adapter) = &inner.video_adapter {
                adapter.unregister_session(session);
            }
            if let Some(adapter) = &inner.audio_adapter {
                adapter.unregister_session(session);
            }
            inner.qos.clone()
        };
        if let Some(qos) = qos {
            qos.unregister_session(session);
        }
        self.stop_video_capture_if_necessary();
        self.stop_audio_capture_if_necessary();
    }

    fn start_video_capture(&self) {
        let mut worker = self.video_worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return;
        }
        let (capture, output) = {
            let inner = self.guard.lock();
            match (&inner.video_capture, &inner.video_output) {
                (Some(capture), Some(output)) => (Arc::clone(capture), Arc::clone(output)),
                _ => {
                    error!("av streamer not initialized");
                    return;
                }
            }
        };
        let calibrator = Arc::clone(&self.calibrator);
        let throttler = Arc::clone(&self.throttler);
        let fatal_sink = self.fatal_sink.lock().clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("video-capture".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    let sample = capture.lock().take_sample();
                    match sample {
                        Ok(Some(mut surface)) => {
                            calibrator.lock().submit_video(&mut surface);
                            if let Err(e) = output.submit_input(surface) {
                                warn_throttled!(
                                    throttler,
                                    "video_submit",
                                    error = %e,
                                    "video frame submission failed, frame dropped"
                                );
                            }
                        }
                        Ok(None) => std::thread::sleep(Duration::from_millis(1)),
                        Err(e) => {
                            // Capture failure is fatal for the whole instance
                            error!(error = %e, "video capture source failed, stopping instance");
                            if let Some(sink) =
                                fatal_sink.as_ref().and_then(|sink| sink.upgrade())
                            {
                                sink.on_capture_failure("video", &e);
                            }
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn video capture thread");
        *worker = Some(CaptureWorker { stop, handle });
        info!("video capture started");
    }

    fn start_audio_capture(&self) {
        let mut worker = self.audio_worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return;
        }
        let (capture, output) = {
            let inner = self.guard.lock();
            match (&inner.audio_capture, &inner.audio_output) {
                (Some(capture), Some(output)) => (Arc::clone(capture), Arc::clone(output)),
                _ => {
                    error!("av streamer not initialized");
                    return;
                }
            }
        };
        let calibrator = Arc::clone(&self.calibrator);
        let throttler = Arc::clone(&self.throttler);
        let fatal_sink = self.fatal_sink.lock().clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    let sample = capture.lock().take_sample();
                    match sample {
                        Ok(Some(mut buffer)) => {
                            calibrator.lock().submit_audio(&mut buffer);
                            match output.submit_input(buffer) {
                                Ok(()) | Err(StreamError::InputFull) => {}
                                Err(e) => {
                                    warn_throttled!(
                                        throttler,
                                        "audio_submit",
                                        error = %e,
                                        "audio buffer submission failed"
                                    );
                                }
                            }
                        }
                        Ok(None) => std::thread::sleep(Duration::from_millis(1)),
                        Err(e) => {
                            // Capture failure is fatal for the whole instance
                            error!(error = %e, "audio capture source failed, stopping instance");
                            if let Some(sink) =
                                fatal_sink.as_ref().and_then(|sink| sink.upgrade())
                            {
                                sink.on_capture_failure("audio", &e);
                            }
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn audio capture thread");
        *worker = Some(CaptureWorker { stop, handle });
        info!("audio capture started");
    }

    fn stop_video_capture_if_necessary(&self) {
        let stop = self.guard.lock().sessions_video.is_empty();
        if stop {
            if let Some(worker) = self.video_worker.lock().take() {
                worker.stop_and_join();
                info!("video capture stopped");
            }
        }
    }

    fn stop_audio_capture_if_necessary(&self) {
        let stop = self.guard.lock().sessions_audio.is_empty();
        if stop {
            if let Some(worker) = self.audio_worker.lock().take() {
                worker.stop_and_join();
                info!("audio capture stopped");
            }
        }
    }

    /// Most recent origin timestamp reported by the active controller
    pub fn last_origin_pts(&self) -> Pts {
        self.guard.lock().last_origin_pts
    }

    pub fn video_session_count(&self) -> usize {
        self.guard.lock().sessions_video.len()
    }

    pub fn audio_session_count(&self) -> usize {
        self.guard.lock().sessions_audio.len()
    }

    pub fn is_video_capture_running(&self) -> bool {
        self.video_worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    pub fn is_audio_capture_running(&self) -> bool {
        self.audio_worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }
}

impl VideoSenderCallback for AvStreamer {
    fn on_video_stream_subscribed(&self, session: SessionHandle, stream_id: StreamId) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "subscribe to invalid video stream ignored");
            return;
        }
        let adapter = {
            let mut inner = self.guard.lock();
            let Some(adapter) = inner.video_adapter.clone() else {
                error!("av streamer not initialized");
                return;
            };
            inner.sessions_video.insert(session);
            adapter
        };

        match adapter.register_session(session) {
            Ok(()) => {
                self.start_video_capture();
                if let Err(e) = adapter.send_init_to_session(session) {
                    warn!(session, error = %e, "failed to send video init block");
                }
                info!(session, stream_id, "session registered for video");
            }
            Err(_) => {
                warn!(session, stream_id, "session already registered for video");
            }
        }
    }

    fn on_video_stream_unsubscribed(&self, session: SessionHandle, stream_id: StreamId) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "unsubscribe from invalid video stream ignored");
            return;
        }
        let qos = {
            let mut inner = self.guard.lock();
            if let Some(adapter) = &inner.video_adapter {
                adapter.unregister_session(session);
            }
            inner.sessions_video.remove(&session);
            inner.qos.clone()
        };
        if let Some(qos) = qos {
            qos.unregister_session(session);
        }
        info!(session, stream_id, "session unregistered from video");
        self.stop_video_capture_if_necessary();
    }

    fn on_ready_to_receive_video(&self, session: SessionHandle, stream_id: StreamId, init_id: InitId) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "video init ack for invalid stream ignored");
            return;
        }
        let (adapter, output) = {
            let inner = self.guard.lock();
            (inner.video_adapter.clone(), inner.video_output.clone())
        };
        let (Some(adapter), Some(output)) = (adapter, output) else {
            error!("av streamer not initialized");
            return;
        };
        if init_id < 0 {
            // Negative ack: the session stays withheld until a later init
            warn!(session, init_id, "video init rejected by receiver");
            return;
        }
        adapter.update_session(session, init_id);
        // A fresh subscriber needs a key frame it can start decoding from
        output.force_key_frame();
        info!(session, init_id, "session ready to receive video");
    }

    fn on_force_update_request(&self, stream_id: StreamId) {
        if stream_id != DEFAULT_STREAM {
            warn!(stream_id, "force update for invalid stream ignored");
            return;
        }
        let output = self.guard.lock().video_output.clone();
        match output {
            Some(output) => {
                output.force_key_frame();
                info!(stream_id, "key/IDR frame forced");
            }
            None => error!("av streamer not initialized"),
        }
    }

    fn on_video_request_init(&self, session: SessionHandle, stream_id: StreamId) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "init request for invalid stream ignored");
            return;
        }
        let adapter = self.guard.lock().video_adapter.clone();
        match adapter {
            Some(adapter) => {
                if let Err(e) = adapter.send_init_to_session(session) {
                    warn!(session, error = %e, "failed to resend video init block");
                }
            }
            None => error!("av streamer not initialized"),
        }
    }

    fn on_bitrate_change_request(&self, session: SessionHandle, stream_id: StreamId, bitrate: i64) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "bitrate change for invalid stream ignored");
            return;
        }
        let output = self.guard.lock().video_output.clone();
        match output {
            Some(output) => match output.set_bitrate(bitrate) {
                Ok(()) => info!(session, bitrate, "video bitrate changed by receiver request"),
                Err(e) => warn!(session, bitrate, error = %e, "failed to set video bitrate"),
            },
            None => error!("av streamer not initialized"),
        }
    }

    fn on_framerate_change_request(&self, session: SessionHandle, stream_id: StreamId, framerate: f32) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "framerate change for invalid stream ignored");
            return;
        }
        let (capture, output) = {
            let inner = self.guard.lock();
            (inner.video_capture.clone(), inner.video_output.clone())
        };
        let (Some(capture), Some(output)) = (capture, output) else {
            error!("av streamer not initialized");
            return;
        };
        capture.lock().set_framerate(framerate);
        match output.set_framerate(framerate) {
            Ok(()) => info!(session, framerate, "encoder framerate changed by receiver request"),
            Err(e) => warn!(session, framerate, error = %e, "failed to set encoder framerate"),
        }
    }

    fn on_resolution_change_request(
        &self,
        session: SessionHandle,
        stream_id: StreamId,
        resolution: Resolution,
    ) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "resolution change for invalid stream ignored");
            return;
        }
        let output = self.guard.lock().video_output.clone();
        match output {
            Some(output) => {
                output.set_encoded_resolution(resolution);
                info!(session, %resolution, "stream resolution changed by receiver request");
            }
            None => error!("av streamer not initialized"),
        }
    }
}

impl AudioSenderCallback for AvStreamer {
    fn on_audio_stream_subscribed(&self, session: SessionHandle, stream_id: StreamId) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "subscribe to invalid audio stream ignored");
            return;
        }
        let adapter = {
            let mut inner = self.guard.lock();
            let Some(adapter) = inner.audio_adapter.clone() else {
                error!("av streamer not initialized");
                return;
            };
            inner.sessions_audio.insert(session);
            adapter
        };

        match adapter.register_session(session) {
            Ok(()) => {
                self.start_audio_capture();
                if let Err(e) = adapter.send_init_to_session(session) {
                    warn!(session, error = %e, "failed to send audio init block");
                }
                info!(session, stream_id, "session registered for audio");
            }
            Err(_) => {
                warn!(session, stream_id, "session already registered for audio");
            }
        }
    }

    fn on_audio_stream_unsubscribed(&self, session: SessionHandle, stream_id: StreamId) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "unsubscribe from invalid audio stream ignored");
            return;
        }
        {
            let mut inner = self.guard.lock();
            if let Some(adapter) = &inner.audio_adapter {
                adapter.unregister_session(session);
            }
            inner.sessions_audio.remove(&session);
        }
        info!(session, stream_id, "session unregistered from audio");
        self.stop_audio_capture_if_necessary();
    }

    fn on_ready_to_receive_audio(&self, session: SessionHandle, stream_id: StreamId, init_id: InitId) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "audio init ack for invalid stream ignored");
            return;
        }
        let adapter = self.guard.lock().audio_adapter.clone();
        let Some(adapter) = adapter else {
            error!("av streamer not initialized");
            return;
        };
        if init_id < 0 {
            warn!(session, init_id, "audio init rejected by receiver");
            return;
        }
        adapter.update_session(session, init_id);
        info!(session, init_id, "session ready to receive audio");
    }

    fn on_audio_request_init(&self, session: SessionHandle, stream_id: StreamId) {
        if stream_id != DEFAULT_STREAM {
            warn!(session, stream_id, "audio init request for invalid stream ignored");
            return;
        }
        let adapter = self.guard.lock().audio_adapter.clone();
        match adapter {
            Some(adapter) => {
                if let Err(e) = adapter.send_init_to_session(session) {
                    warn!(session, error = %e, "failed to resend audio init block");
                }
            }
            None => error!("av streamer not initialized"),
        }
    }
}

impl StatsCallback for AvStreamer {
    fn on_receiver_stats(&self, session: SessionHandle, _stream_id: StreamId, stats: &ReceiverStats) {
        let qos = {
            let inner = self.guard.lock();
            if !inner.sessions_video.contains(&session) {
                return;
            }
            inner.qos.clone()
        };
        if let Some(qos) = qos {
            qos.update_session_stats(
                session,
                stats.last_stats_time,
                stats.receiver_framerate,
                stats.key_frame_req_count,
                stats.worst_send_time,
                stats.decoder_queue_depth,
            );
        }
        info!(
            full = stats.full_latency,
            client = stats.client_latency,
            server = stats.server_latency,
            encoder = stats.encoder_latency,
            network = stats.network_latency,
            decoder = stats.decoder_latency,
            fps = stats.receiver_framerate,
            "receiver latency (ms)"
        );
    }

    fn on_origin_pts(&self, _session: SessionHandle, _stream_id: StreamId, origin_pts: Pts) {
        let mut inner = self.guard.lock();
        inner.last_origin_pts = origin_pts;
        inner.time_of_last_origin_pts = now_pts();
    }
}

impl QosListener for AvStreamer {
    fn on_qos_event(&self, stream_id: StreamId, event: &QosEvent) {
        match event {
            QosEvent::FpsChange(framerate) => {
                debug!(stream_id, framerate, "qos framerate change");
                let (capture, output) = {
                    let inner = self.guard.lock();
                    (inner.video_capture.clone(), inner.video_output.clone())
                };
                if let Some(capture) = capture {
                    capture.lock().set_framerate(*framerate);
                }
                if let Some(output) = output {
                    if let Err(e) = output.set_framerate(*framerate) {
                        warn!(error = %e, "qos failed to set encoder framerate");
                    }
                }
            }
            QosEvent::VideoBitrateChanged(bitrate) => {
                debug!(stream_id, bitrate, "qos bitrate change");
                let output = self.guard.lock().video_output.clone();
                if let Some(output) = output {
                    if let Err(e) = output.set_bitrate(*bitrate) {
                        warn!(error = %e, "qos failed to set video bitrate");
                    }
                }
            }
            QosEvent::Panic { reason } => warn!(stream_id, ?reason, "qos panic"),
            QosEvent::PanicEnded => info!(stream_id, "qos panic ended"),
            QosEvent::FpsReachedLow(framerate) => debug!(stream_id, framerate, "qos fps at low limit"),
            QosEvent::FpsReachedHigh(framerate) => {
                debug!(stream_id, framerate, "qos fps at high limit")
            }
            QosEvent::VideoBitrateLow(bitrate) => debug!(stream_id, bitrate, "qos bitrate at low limit"),
            QosEvent::VideoBitrateHigh(bitrate) => {
                debug!(stream_id, bitrate, "qos bitrate at high limit")
            }
            QosEvent::VideoEncoderQueueThresholdExceeded(depth) => {
                warn!(stream_id, depth, "encoder queue threshold exceeded")
            }
        }
    }
}
