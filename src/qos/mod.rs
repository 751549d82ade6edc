//! Stream quality-of-service controller
//!
//! A control loop driven inline by the encoder polling thread. Each call
//! observes the encoder's state plus asynchronously uploaded per-session
//! receiver statistics, and nudges encoder bitrate and framerate with
//! hysteresis, rate-of-change throttles and a saturating panic mode.
//!
//! Events are emitted synchronously from inside the loop; the listener must
//! not call back into the controller.

pub mod history;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Weak;
use tracing::{debug, info, warn};

use crate::transport::{SessionHandle, StreamId};
use crate::utils::clock::{now_pts, secs_to_pts, Pts, PTS_PER_SECOND};
use history::ValueHistory;

const MAX_DECODER_OVERFLOW_EVENTS: u32 = 5;
const MAX_CONGESTION_EVENTS: u32 = 5;

/// What the controller is allowed to adjust
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosStrategy {
    AdjustFramerate,
    AdjustVideoBitrate,
    AdjustBoth,
}

impl QosStrategy {
    fn framerate_allowed(self) -> bool {
        matches!(self, QosStrategy::AdjustFramerate | QosStrategy::AdjustBoth)
    }

    fn bitrate_allowed(self) -> bool {
        matches!(self, QosStrategy::AdjustVideoBitrate | QosStrategy::AdjustBoth)
    }
}

/// Why the controller entered panic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicReason {
    /// No statistics arriving from any client
    NoClientData,
    /// Force-IDR request count crossed the panic threshold
    TooManyIdrRequests,
    /// A client's decoder queue exceeded its depth limit
    ClientCantKeepUp,
}

/// Events pushed to the listener as adjustments are decided
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QosEvent {
    Panic { reason: PanicReason },
    PanicEnded,
    FpsChange(f32),
    FpsReachedLow(f32),
    FpsReachedHigh(f32),
    VideoBitrateChanged(i64),
    VideoBitrateLow(i64),
    VideoBitrateHigh(i64),
    VideoEncoderQueueThresholdExceeded(i64),
}

/// Control loop tuning
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Seconds without client statistics before panic
    pub time_before_panic_secs: f32,
    /// Force-IDR requests per stats interval that trigger quality lowering
    pub threshold_idr: i64,
    /// Force-IDR requests per stats interval that trigger panic
    pub panic_threshold_idr: i64,
    pub max_encoder_queue_depth: i64,
    pub max_decoder_queue_depth: i64,
    pub strategy: QosStrategy,
    pub min_framerate: f32,
    pub max_framerate: f32,
    pub framerate_step: f32,
    pub framerate_adjustment_period_secs: f32,
    pub min_bitrate: i64,
    pub max_bitrate: i64,
    pub bitrate_step: i64,
    pub bitrate_adjustment_period_secs: f32,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            time_before_panic_secs: 10.0,
            threshold_idr: 10,
            panic_threshold_idr: 50,
            max_encoder_queue_depth: 3,
            max_decoder_queue_depth: 3,
            strategy: QosStrategy::AdjustBoth,
            min_framerate: 15.0,
            max_framerate: 60.0,
            framerate_step: 5.0,
            framerate_adjustment_period_secs: 5.0,
            min_bitrate: 1_000_000,
            max_bitrate: 50_000_000,
            bitrate_step: 1_000_000,
            bitrate_adjustment_period_secs: 10.0,
        }
    }
}

/// Observables supplied by the encoder polling thread on every frame
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoOutputStats {
    pub encoder_queue_depth: i64,
    pub encoder_target_bitrate: i64,
    pub encoder_target_framerate: f32,
    /// This frame's byte size (bandwidth contribution)
    pub bandwidth: i64,
}

/// Implemented by the orchestrator; must not reenter the controller.
pub trait QosListener: Send + Sync {
    fn on_qos_event(&self, stream_id: StreamId, event: &QosEvent);
}

#[derive(Debug, Default)]
struct SessionQosInfo {
    framerate_history: ValueHistory<f32, 4>,
    force_idr_req_count: i64,
    force_idr_update_time: Pts,
    decoder_queue_depth: i64,
    decoder_overflow_count: u32,
    decoder_overflow_fps: f32,
    congestion_count: u32,
    congestion_bitrate: i64,
}

#[derive(Debug, Default)]
struct State {
    first_frame_time: Pts,
    last_frame_time: Pts,
    framerate: f32,
    framerate_history: ValueHistory<f32, 4>,
    last_fps_adjustment_time: Pts,
    accumulated_bandwidth: i64,
    bitrate: i64,
    bitrate_history: ValueHistory<i64, 4>,
    last_bitrate_adjustment_time: Pts,
    encoder_queue_depth: i64,
    panic: bool,
    last_panic_time: Pts,
    sessions: HashMap<SessionHandle, SessionQosInfo>,
    worst_send_time: f32,
    worst_send_time_history: ValueHistory<f32, 5>,
}

/// Per-stream QoS controller
pub struct QosController {
    config: QosConfig,
    stream_id: StreamId,
    listener: Mutex<Option<Weak<dyn QosListener>>>,
    state: Mutex<State>,
}

impl QosController {
    pub fn new(config: QosConfig, stream_id: StreamId) -> Self {
        Self {
            config,
            stream_id,
            listener: Mutex::new(None),
            state: Mutex::new(State::default()),
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn QosListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub fn config(&self) -> &QosConfig {
        &self.config
    }

    fn emit(&self, event: QosEvent) {
        let listener = self.listener.lock().as_ref().and_then(|w| w.upgrade());
        if let Some(listener) = listener {
            listener.on_qos_event(self.stream_id, &event);
        }
    }

    /// Asynchronous upload of one session's receiver statistics.
    pub fn update_session_stats(
        &self,
        session: SessionHandle,
        last_stats_time: Pts,
        framerate: f32,
        force_idr_req_count: i64,
        send_time: f32,
        decoder_queue_depth: i64,
    ) {
        let now = now_pts();
        let mut state = self.state.lock();
        let info = state.sessions.entry(session).or_default();
        info.framerate_history.add_value(framerate, last_stats_time);
        if info.force_idr_update_time < last_stats_time {
            info.force_idr_req_count = force_idr_req_count;
            info.force_idr_update_time = last_stats_time;
            info.decoder_queue_depth = decoder_queue_depth;
        }
        if send_time > state.worst_send_time {
            state.worst_send_time = send_time;
            state.worst_send_time_history.add_value(send_time, now);
        }
    }

    /// Remove a disconnected session; restores defaults when it was the last.
    pub fn unregister_session(&self, session: SessionHandle) {
        let mut state = self.state.lock();
        state.sessions.remove(&session);
        if state.sessions.is_empty() {
            self.reset_counters(&mut state);
        }
    }

    /// The control loop. Called by the encoder polling thread for every
    /// compressed frame.
    pub fn adjust_stream_quality(&self, stats: VideoOutputStats) {
        let cfg = &self.config;
        let now = now_pts();
        let time_before_panic = secs_to_pts(cfg.time_before_panic_secs);
        let fps_period = secs_to_pts(cfg.framerate_adjustment_period_secs);
        let bitrate_period = secs_to_pts(cfg.bitrate_adjustment_period_secs);

        let mut state = self.state.lock();
        state.encoder_queue_depth = stats.encoder_queue_depth;

        if state.first_frame_time == 0 {
            state.first_frame_time = now;
            state.last_frame_time = now;
            state.bitrate = stats.encoder_target_bitrate;
            state.framerate = stats.encoder_target_framerate;
        } else {
            let seconds_between_frames =
                (now - state.last_frame_time) as f32 / PTS_PER_SECOND as f32;
            state.last_frame_time = now;
            if seconds_between_frames > 0.0 {
                let sample = 1.0 / seconds_between_frames;
                state.framerate_history.add_value(sample, now);
                if state.framerate_history.is_full() {
                    state.framerate = state.framerate_history.average();
                }
            }

            state.accumulated_bandwidth += stats.bandwidth;
            let since_bitrate_measure = now - state.bitrate_history.last_update_time();
            if since_bitrate_measure > PTS_PER_SECOND {
                let bitrate =
                    (PTS_PER_SECOND * 8 * state.accumulated_bandwidth) / since_bitrate_measure;
                state.bitrate_history.add_value(bitrate, now);
                state.accumulated_bandwidth = 0;
            }
        }

        if state.last_fps_adjustment_time == 0 || state.last_bitrate_adjustment_time == 0 {
            // First call, start the adjustment clocks
            state.last_fps_adjustment_time = now;
            state.last_bitrate_adjustment_time = now;
            return;
        }

        let mut panic = false;
        let mut panic_reason = PanicReason::NoClientData;
        let mut lower_framerate = false;
        let mut lower_bitrate = false;
        let mut immediate = false;
        let mut target_framerate = stats.encoder_target_framerate;
        let mut target_bitrate = stats.encoder_target_bitrate;

        if now - state.first_frame_time > time_before_panic
            && state.sessions.is_empty()
            && !state.panic
        {
            // Streaming has started but no client has reported statistics yet
            panic = true;
            lower_framerate = true;
            lower_bitrate = true;
            warn!("no client statistics since stream start, entering panic");
        } else {
            let measured_framerate = state.framerate;
            let current_bitrate = state.bitrate;
            let last_fps_adjustment = state.last_fps_adjustment_time;

            for info in state.sessions.values_mut() {
                if info.force_idr_req_count > cfg.panic_threshold_idr {
                    panic = true;
                    lower_framerate = true;
                    lower_bitrate = true;
                    panic_reason = PanicReason::TooManyIdrRequests;
                    warn!(
                        count = info.force_idr_req_count,
                        "too many key frame repeat requests, entering panic"
                    );
                    break;
                } else if info.force_idr_req_count > cfg.threshold_idr {
                    lower_framerate = true;
                    lower_bitrate = true;
                    info!(
                        count = info.force_idr_req_count,
                        "client requesting key frames, lowering bitrate and frame rate"
                    );
                }

                if info.decoder_queue_depth > 0 {
                    lower_framerate = true;
                    if info.decoder_queue_depth > cfg.max_decoder_queue_depth {
                        panic = true;
                        panic_reason = PanicReason::ClientCantKeepUp;
                        warn!(
                            depth = info.decoder_queue_depth,
                            fps = measured_framerate,
                            "client decoder cannot keep up, entering panic"
                        );
                    }
                    if now - last_fps_adjustment > fps_period / 4 {
                        immediate = true;
                        if !panic {
                            info.decoder_overflow_count += 1;
                            if info.decoder_overflow_count > MAX_DECODER_OVERFLOW_EVENTS {
                                info.decoder_overflow_fps = measured_framerate;
                                warn!(
                                    depth = info.decoder_queue_depth,
                                    overflow_count = info.decoder_overflow_count,
                                    "repeated decoder overflow, limiting frame rate"
                                );
                            }
                        } else {
                            info.decoder_overflow_count = 0;
                        }
                    }
                }

                if info.framerate_history.is_full() {
                    if now - info.framerate_history.last_update_time() > time_before_panic {
                        panic = true;
                        panic_reason = PanicReason::NoClientData;
                        lower_framerate = true;
                        lower_bitrate = true;
                        warn!("client statistics stopped arriving, entering panic");
                        break;
                    }

                    let session_framerate = info.framerate_history.average();
                    if session_framerate != 0.0
                        && measured_framerate != 0.0
                        && measured_framerate > session_framerate * 1.15
                        && now - last_fps_adjustment > fps_period
                    {
                        // Receiver fps below ~87% of the server's: congestion
                        lower_bitrate = true;
                        info.framerate_history.clear();
                        warn!(
                            receiver_fps = session_framerate,
                            server_fps = measured_framerate,
                            "receiver frame rate lagging, lowering bitrate"
                        );
                        info.congestion_count += 1;
                        if info.congestion_count > MAX_CONGESTION_EVENTS {
                            info.congestion_bitrate = current_bitrate;
                            warn!(
                                bitrate = current_bitrate,
                                "persistent congestion, limiting video bitrate"
                            );
                        }
                    }
                }

                if info.decoder_overflow_count > MAX_DECODER_OVERFLOW_EVENTS
                    && target_framerate >= info.decoder_overflow_fps
                {
                    target_framerate =
                        (info.decoder_overflow_fps - cfg.framerate_step).max(cfg.min_framerate);
                }
                if info.congestion_count > MAX_CONGESTION_EVENTS
                    && target_bitrate >= info.congestion_bitrate
                {
                    target_bitrate = (info.congestion_bitrate - cfg.bitrate_step).max(cfg.min_bitrate);
                }
            }

            if !panic {
                if state.framerate != 0.0 && !lower_bitrate {
                    let frame_time_ms = 1000.0 / state.framerate;
                    if state.worst_send_time > frame_time_ms * 2.0
                        || (state.worst_send_time_history.is_full()
                            && state.worst_send_time_history.average() > frame_time_ms)
                    {
                        // Spikes in send() duration indicate network hiccups
                        lower_bitrate = true;
                        lower_framerate = true;
                        state.worst_send_time = 0.0;
                        warn!("send is taking too long, lowering bitrate and frame rate");
                    }
                }

                if state.encoder_queue_depth > cfg.max_encoder_queue_depth {
                    lower_framerate = true;
                    immediate = true;
                    self.emit(QosEvent::VideoEncoderQueueThresholdExceeded(
                        state.encoder_queue_depth,
                    ));
                    warn!(
                        depth = state.encoder_queue_depth,
                        "video encoder cannot keep up, lowering frame rate"
                    );
                }
            }
        }

        if panic {
            if now - state.last_panic_time > time_before_panic {
                state.last_panic_time = now;
                if !state.panic {
                    self.emit(QosEvent::Panic {
                        reason: panic_reason,
                    });
                    if cfg.strategy.framerate_allowed() && lower_framerate {
                        warn!("panic: setting frame rate to minimum");
                        self.adjust_framerate(&mut state, cfg.min_framerate, now);
                        state.framerate_history.clear();
                    }
                    if cfg.strategy.bitrate_allowed() && lower_bitrate {
                        warn!("panic: setting bitrate to minimum");
                        self.adjust_bitrate(&mut state, cfg.min_bitrate, now);
                        state.bitrate_history.clear();
                    }
                    state.panic = true;
                }
            }
        } else {
            if state.panic {
                state.panic = false;
                self.emit(QosEvent::PanicEnded);
                info!("panic ended");
            }

            let fps_window_open = now - state.last_fps_adjustment_time > fps_period
                && state.framerate_history.is_full();
            if (cfg.strategy.framerate_allowed() && fps_window_open) || immediate {
                if lower_framerate {
                    debug!(step = cfg.framerate_step, "decreasing frame rate");
                    let target = state.framerate - cfg.framerate_step;
                    self.adjust_framerate(&mut state, target, now);
                } else if state.framerate < target_framerate {
                    debug!(step = cfg.framerate_step, "increasing frame rate");
                    let target = state.framerate + cfg.framerate_step;
                    self.adjust_framerate(&mut state, target, now);
                }
            }

            if cfg.strategy.bitrate_allowed()
                && now - state.last_bitrate_adjustment_time > bitrate_period
                && state.bitrate_history.is_full()
            {
                if lower_bitrate {
                    debug!(step = cfg.bitrate_step, "decreasing video bitrate");
                    let target = state.bitrate - cfg.bitrate_step;
                    self.adjust_bitrate(&mut state, target, now);
                } else if state.bitrate < target_bitrate {
                    debug!(step = cfg.bitrate_step, "increasing video bitrate");
                    let target = state.bitrate + cfg.bitrate_step;
                    self.adjust_bitrate(&mut state, target, now);
                }
            }
        }
    }

    fn adjust_framerate(&self, state: &mut State, mut target: f32, now: Pts) {
        let cfg = &self.config;
        if target < cfg.min_framerate {
            target = cfg.min_framerate;
            if state.framerate != cfg.min_framerate {
                self.emit(QosEvent::FpsReachedLow(target));
            }
        } else if target > cfg.max_framerate {
            target = cfg.max_framerate;
            if state.framerate != cfg.max_framerate {
                self.emit(QosEvent::FpsReachedHigh(target));
            }
        }
        if target != state.framerate {
            self.emit(QosEvent::FpsChange(target));
            state.last_fps_adjustment_time = now;
        }
    }

    fn adjust_bitrate(&self, state: &mut State, mut target: i64, now: Pts) {
        let cfg = &self.config;
        if target < cfg.min_bitrate {
            target = cfg.min_bitrate;
            if state.bitrate != cfg.min_bitrate {
                self.emit(QosEvent::VideoBitrateLow(target));
            }
        } else if target > cfg.max_bitrate {
            target = cfg.max_bitrate;
            if state.bitrate != cfg.max_bitrate {
                self.emit(QosEvent::VideoBitrateHigh(target));
            }
        }
        if target != state.bitrate {
            self.emit(QosEvent::VideoBitrateChanged(target));
            state.last_bitrate_adjustment_time = now;
            state.bitrate = target;
        }
    }

    fn reset_counters(&self, state: &mut State) {
        state.first_frame_time = 0;
        state.last_frame_time = 0;
        state.framerate = 0.0;
        state.framerate_history.clear();
        state.last_fps_adjustment_time = 0;
        state.accumulated_bandwidth = 0;
        state.bitrate_history.clear();
        state.last_bitrate_adjustment_time = 0;
        state.panic = false;
        state.last_panic_time = 0;
        state.sessions.clear();
        state.worst_send_time = 0.0;
        state.worst_send_time_history.clear();

        // Last session gone: restore the configured maxima
        self.emit(QosEvent::FpsChange(self.config.max_framerate));
        self.emit(QosEvent::VideoBitrateChanged(self.config.max_bitrate));
        state.bitrate = self.config.max_bitrate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct Recorder {
        events: PlMutex<Vec<QosEvent>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: PlMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<QosEvent> {
            self.events.lock().clone()
        }
    }

    impl QosListener for Recorder {
        fn on_qos_event(&self, _stream_id: StreamId, event: &QosEvent) {
            self.events.lock().push(*event);
        }
    }

    fn test_config() -> QosConfig {
        QosConfig {
            time_before_panic_secs: 0.05,
            threshold_idr: 5,
            panic_threshold_idr: 20,
            max_encoder_queue_depth: 3,
            max_decoder_queue_depth: 3,
            strategy: QosStrategy::AdjustBoth,
            min_framerate: 15.0,
            max_framerate: 60.0,
            framerate_step: 5.0,
            framerate_adjustment_period_secs: 0.01,
            min_bitrate: 1_000_000,
            max_bitrate: 50_000_000,
            bitrate_step: 1_000_000,
            bitrate_adjustment_period_secs: 0.01,
        }
    }

    fn stats(queue_depth: i64) -> VideoOutputStats {
        VideoOutputStats {
            encoder_queue_depth: queue_depth,
            encoder_target_bitrate: 20_000_000,
            encoder_target_framerate: 60.0,
            bandwidth: 40_000,
        }
    }

    fn wire(controller: &QosController, recorder: &Arc<Recorder>) -> Arc<dyn QosListener> {
        let listener: Arc<dyn QosListener> = recorder.clone();
        controller.set_listener(Arc::downgrade(&listener));
        listener
    }

    #[test]
    fn test_no_panic_before_first_frame() {
        let controller = QosController::new(test_config(), 0);
        let recorder = Recorder::new();
        let _listener = wire(&controller, &recorder);

        thread::sleep(Duration::from_millis(80));
        // No frames submitted: the loop has never run, no events possible
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_startup_panic_without_client_stats() {
        let controller = QosController::new(test_config(), 0);
        let recorder = Recorder::new();
        let _listener = wire(&controller, &recorder);

        controller.adjust_stream_quality(stats(0)); // seeds first frame time
        controller.adjust_stream_quality(stats(0)); // starts adjustment clocks
        thread::sleep(Duration::from_millis(80));
        controller.adjust_stream_quality(stats(0));

        let events = recorder.events();
        assert!(events.iter().any(|e| matches!(
            e,
            QosEvent::Panic {
                reason: PanicReason::NoClientData
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, QosEvent::FpsChange(fps) if *fps == 15.0)));
        assert!(events
            .iter()
            .any(|e| matches!(e, QosEvent::VideoBitrateChanged(b) if *b == 1_000_000)));
    }

    #[test]
    fn test_idr_storm_triggers_panic() {
        let config = test_config();
        let controller = QosController::new(config.clone(), 0);
        let recorder = Recorder::new();
        let _listener = wire(&controller, &recorder);

        controller.adjust_stream_quality(stats(0));
        controller.adjust_stream_quality(stats(0));
        controller.update_session_stats(1, now_pts(), 60.0, config.panic_threshold_idr + 1, 0.5, 0);
        thread::sleep(Duration::from_millis(80));
        controller.adjust_stream_quality(stats(0));

        let events = recorder.events();
        let panic_pos = events.iter().position(|e| {
            matches!(
                e,
                QosEvent::Panic {
                    reason: PanicReason::TooManyIdrRequests
                }
            )
        });
        assert!(panic_pos.is_some(), "events: {:?}", events);
        // Panic forces both knobs to their minimums
        assert!(events
            .iter()
            .skip(panic_pos.unwrap())
            .any(|e| matches!(e, QosEvent::FpsChange(fps) if *fps == 15.0)));
        assert!(events
            .iter()
            .skip(panic_pos.unwrap())
            .any(|e| matches!(e, QosEvent::VideoBitrateChanged(b) if *b == 1_000_000)));
    }

    #[test]
    fn test_stable_session_emits_nothing() {
        let config = test_config();
        let controller = QosController::new(config, 0);
        let recorder = Recorder::new();
        let _listener = wire(&controller, &recorder);

        for _ in 0..20 {
            controller.update_session_stats(1, now_pts(), 60.0, 0, 0.5, 0);
            controller.adjust_stream_quality(stats(0));
            thread::sleep(Duration::from_millis(2));
        }
        // Receiver keeps up, encoder queue empty, stats flowing: no events
        // other than (possibly) upward nudges that are capped by the target
        let events = recorder.events();
        assert!(
            events.iter().all(|e| !matches!(e, QosEvent::Panic { .. })),
            "events: {:?}",
            events
        );
    }

    #[test]
    fn test_encoder_queue_overflow_lowers_framerate() {
        let controller = QosController::new(test_config(), 0);
        let recorder = Recorder::new();
        let _listener = wire(&controller, &recorder);

        controller.adjust_stream_quality(stats(0));
        controller.adjust_stream_quality(stats(0));
        controller.update_session_stats(1, now_pts(), 60.0, 0, 0.5, 0);
        thread::sleep(Duration::from_millis(20));
        controller.adjust_stream_quality(stats(10));

        let events = recorder.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, QosEvent::VideoEncoderQueueThresholdExceeded(10))));
        assert!(events
            .iter()
            .any(|e| matches!(e, QosEvent::FpsChange(_))));
    }

    #[test]
    fn test_outputs_stay_within_limits() {
        let config = test_config();
        let controller = QosController::new(config.clone(), 0);
        let recorder = Recorder::new();
        let _listener = wire(&controller, &recorder);

        // Hammer the loop with alternating overload and recovery
        for i in 0..50 {
            controller.update_session_stats(1, now_pts(), 60.0, 0, 0.5, (i % 5) as i64);
            controller.adjust_stream_quality(stats((i % 7) as i64));
            thread::sleep(Duration::from_millis(1));
        }
        for event in recorder.events() {
            match event {
                QosEvent::FpsChange(fps)
                | QosEvent::FpsReachedLow(fps)
                | QosEvent::FpsReachedHigh(fps) => {
                    assert!(fps >= config.min_framerate && fps <= config.max_framerate);
                }
                QosEvent::VideoBitrateChanged(b)
                | QosEvent::VideoBitrateLow(b)
                | QosEvent::VideoBitrateHigh(b) => {
                    assert!(b >= config.min_bitrate && b <= config.max_bitrate);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_congestion_clamps_bitrate_ceiling() {
        let config = QosConfig {
            time_before_panic_secs: 30.0,
            threshold_idr: 50,
            panic_threshold_idr: 100,
            max_encoder_queue_depth: 50,
            max_decoder_queue_depth: 50,
            strategy: QosStrategy::AdjustBoth,
            min_framerate: 15.0,
            max_framerate: 60.0,
            framerate_step: 5.0,
            framerate_adjustment_period_secs: 0.2,
            min_bitrate: 1_000_000,
            max_bitrate: 50_000_000,
            bitrate_step: 10_000_000,
            bitrate_adjustment_period_secs: 0.2,
        };
        let controller = QosController::new(config.clone(), 0);
        let recorder = Recorder::new();
        let _listener = wire(&controller, &recorder);

        let observables = VideoOutputStats {
            encoder_queue_depth: 0,
            encoder_target_bitrate: 20_000_000,
            encoder_target_framerate: 60.0,
            bandwidth: 100_000,
        };

        // Receiver stuck at a fraction of the server frame rate long enough
        // to cross the congestion event threshold and fill the bitrate
        // history (one sample per second)
        for _ in 0..110 {
            controller.update_session_stats(1, now_pts(), 10.0, 0, 0.1, 0);
            controller.adjust_stream_quality(observables);
            thread::sleep(Duration::from_millis(50));
        }
        let lowered = recorder
            .events()
            .iter()
            .filter_map(|e| match e {
                QosEvent::VideoBitrateChanged(b) => Some(*b),
                QosEvent::VideoBitrateLow(b) => Some(*b),
                _ => None,
            })
            .min();
        assert!(
            lowered.is_some_and(|b| b < 20_000_000),
            "sustained congestion must lower the bitrate, events: {:?}",
            recorder.events()
        );

        // Receiver recovers; the clamped ceiling keeps the bitrate from
        // climbing back toward the configured maximum
        for _ in 0..40 {
            controller.update_session_stats(1, now_pts(), 60.0, 0, 0.1, 0);
            controller.adjust_stream_quality(observables);
            thread::sleep(Duration::from_millis(50));
        }
        let max_after_recovery = recorder
            .events()
            .iter()
            .filter_map(|e| match e {
                QosEvent::VideoBitrateChanged(b) => Some(*b),
                QosEvent::VideoBitrateHigh(b) => Some(*b),
                _ => None,
            })
            .max()
            .unwrap();
        assert!(
            max_after_recovery < 20_000_000,
            "ceiling clamp must hold below the congestion bitrate, saw {}",
            max_after_recovery
        );
    }

    #[test]
    fn test_last_unregister_resets_to_maxima() {
        let config = test_config();
        let controller = QosController::new(config.clone(), 0);
        let recorder = Recorder::new();
        let _listener = wire(&controller, &recorder);

        controller.update_session_stats(1, now_pts(), 60.0, 0, 0.5, 0);
        controller.unregister_session(1);

        let events = recorder.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, QosEvent::FpsChange(fps) if *fps == config.max_framerate)));
        assert!(events
            .iter()
            .any(|e| matches!(e, QosEvent::VideoBitrateChanged(b) if *b == config.max_bitrate)));
    }
}
