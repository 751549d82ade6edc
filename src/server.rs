//! Top-level streaming server
//!
//! Explicit wiring of the whole system: transport, transmitter adapters,
//! video/audio pipelines, QoS and the AV streamer are constructed here and
//! owned here. Components call back up through weak references registered
//! after construction, so ownership stays a tree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info};

use crate::audio::convert::SoftwareAudioConverter;
use crate::audio::encoder::{AudioEncodeEngine, LoopbackAudioEncoder};
use crate::audio::format::{AudioStreamParams, ChannelLayout, SampleFormat};
use crate::audio::output::{AudioOutput, AudioOutputSetup};
use crate::audio::AudioTransmitterAdapter;
use crate::capture::{
    AudioCaptureSource, SyntheticAudioSource, SyntheticVideoSource, VideoCaptureSource,
};
use crate::config::AppConfig;
use crate::error::{Result, StreamError};
use crate::qos::{QosController, QosListener};
use crate::streamer::{AvStreamer, FatalErrorSink};
use crate::transport::server::{ServerTransport, ServerTransportConfig};
use crate::transport::{
    AudioSenderCallback, ClientRole, ConnectionManagerCallback, FrameSink, SessionHandle,
    StatsCallback, TerminationReason, VideoSenderCallback, DEFAULT_STREAM,
};
use crate::video::convert::SoftwareConverter;
use crate::video::encoder::{LoopbackEncoder, VideoEncodeEngine};
use crate::video::format::{Resolution, SurfaceFormat};
use crate::video::output::{MonoscopicVideoOutput, VideoOutputSetup};
use crate::video::VideoTransmitterAdapter;

/// Admission control and session lifecycle fan-out
struct ConnectionManager {
    max_subscribers: usize,
    streamer: Weak<AvStreamer>,
}

impl ConnectionManagerCallback for ConnectionManager {
    fn on_discovery_request(&self, subscriber_count: usize) -> bool {
        subscriber_count < self.max_subscribers
    }

    fn on_connection_request(&self, _session: SessionHandle, _role: ClientRole) -> bool {
        // Role conflicts are resolved by demotion, not refusal
        true
    }

    fn on_session_terminated(&self, session: SessionHandle, reason: TerminationReason) {
        info!(session, ?reason, "session left");
        if let Some(streamer) = self.streamer.upgrade() {
            streamer.on_session_disconnected(session);
        }
    }
}

/// Handles unrecoverable capture failures: a capture source dying takes
/// down both capture threads and every session. Teardown runs on its own
/// thread so the failing capture thread can exit and be joined.
struct FatalErrorHandler {
    transport: Weak<ServerTransport>,
    streamer: Weak<AvStreamer>,
    video_output: Weak<MonoscopicVideoOutput>,
    audio_output: Weak<AudioOutput>,
    stopped: Arc<AtomicBool>,
}

impl FatalErrorSink for FatalErrorHandler {
    fn on_capture_failure(&self, source: &str, error: &StreamError) {
        error!(source, error = %error, "capture source failed, stopping server instance");
        let transport = self.transport.clone();
        let streamer = self.streamer.clone();
        let video_output = self.video_output.clone();
        let audio_output = self.audio_output.clone();
        let stopped = Arc::clone(&self.stopped);
        std::thread::Builder::new()
            .name("fatal-teardown".to_string())
            .spawn(move || {
                if let Some(transport) = transport.upgrade() {
                    transport.shutdown();
                }
                if let Some(streamer) = streamer.upgrade() {
                    streamer.terminate();
                }
                if let Some(output) = video_output.upgrade() {
                    output.terminate();
                }
                if let Some(output) = audio_output.upgrade() {
                    output.terminate();
                }
                stopped.store(true, Ordering::SeqCst);
            })
            .expect("failed to spawn teardown thread");
    }
}

pub struct StreamingServer {
    transport: Arc<ServerTransport>,
    streamer: Arc<AvStreamer>,
    video_output: Arc<MonoscopicVideoOutput>,
    audio_output: Arc<AudioOutput>,
    // Held so the transport's and streamer's weak callbacks stay alive
    _connection_manager: Arc<ConnectionManager>,
    _fatal_handler: Arc<FatalErrorHandler>,
    stopped: Arc<AtomicBool>,
}

impl StreamingServer {
    /// Build a server with the synthetic capture sources and loopback
    /// codecs. Production deployments swap in real engines through
    /// [`StreamingServer::with_components`].
    pub fn new(config: AppConfig) -> Result<Self> {
        let video_capture = Box::new(SyntheticVideoSource::new(
            Resolution::new(config.video.width, config.video.height),
            config.video.framerate,
        ));
        let audio_params = AudioStreamParams::new(
            config.audio.sampling_rate,
            config.audio.channels,
            ChannelLayout::default_for_channels(config.audio.channels),
            SampleFormat::F32,
        );
        let audio_capture = Box::new(SyntheticAudioSource::new(audio_params));
        Self::with_components(
            config,
            video_capture,
            Box::new(LoopbackEncoder::new(60)),
            audio_capture,
            Some(Box::new(LoopbackAudioEncoder::new(audio_params))),
        )
    }

    pub fn with_components(
        config: AppConfig,
        video_capture: Box<dyn VideoCaptureSource>,
        video_encoder: Box<dyn VideoEncodeEngine>,
        audio_capture: Box<dyn AudioCaptureSource>,
        audio_encoder: Option<Box<dyn AudioEncodeEngine>>,
    ) -> Result<Self> {
        let stream_resolution = Resolution::new(config.video.width, config.video.height);
        let audio_params = AudioStreamParams::new(
            config.audio.sampling_rate,
            config.audio.channels,
            ChannelLayout::default_for_channels(config.audio.channels),
            SampleFormat::F32,
        );

        let video_codec = video_encoder.codec_name().to_string();
        let audio_codec = audio_encoder
            .as_ref()
            .map(|e| e.codec_id().to_string())
            .unwrap_or_else(|| crate::audio::encoder::CODEC_ID_PCM.to_string());

        let transport = ServerTransport::new(ServerTransportConfig {
            bind_address: config.network.bind_address.clone(),
            port: config.network.port,
            protocol: config.network.protocol,
            passphrase: config.network.passphrase.clone(),
            idle_timeout_secs: config.network.idle_timeout_secs,
            video_codecs: vec![video_codec],
            audio_codecs: vec![audio_codec],
            default_resolution: stream_resolution,
            default_bitrate: config.video.bitrate,
            default_framerate: config.video.framerate,
            audio_channels: audio_params.channels,
            audio_layout: audio_params.layout.0,
            sampling_rate: audio_params.sampling_rate,
        });
        let frame_sink: Arc<dyn FrameSink> = Arc::clone(&transport) as Arc<dyn FrameSink>;

        let qos = Arc::new(QosController::new(config.qos.clone(), DEFAULT_STREAM));

        let video_adapter = Arc::new(VideoTransmitterAdapter::new(
            Arc::clone(&frame_sink),
            DEFAULT_STREAM,
            Some(Arc::clone(&qos)),
        ));
        let video_output = Arc::new(MonoscopicVideoOutput::new(
            Arc::clone(&video_adapter),
            video_encoder,
            Box::new(SoftwareConverter::new()),
        ));
        video_output.init(&VideoOutputSetup {
            input_format: SurfaceFormat::Nv12,
            input_resolution: stream_resolution,
            stream_resolution,
            bitrate: config.video.bitrate,
            framerate: config.video.framerate,
            hdr: config.video.hdr,
            preserve_aspect_ratio: config.video.preserve_aspect_ratio,
            intra_refresh_period: config.video.intra_refresh_period,
        })?;

        let audio_adapter = Arc::new(AudioTransmitterAdapter::new(frame_sink, DEFAULT_STREAM));
        let audio_output = Arc::new(AudioOutput::new(
            Arc::clone(&audio_adapter),
            audio_encoder,
            Box::new(SoftwareAudioConverter::new()),
        ));
        audio_output.init(&AudioOutputSetup {
            input: audio_params,
            output: audio_params,
            bitrate: config.audio.bitrate,
        })?;

        let streamer = AvStreamer::new();
        streamer.init(
            video_capture,
            Arc::clone(&video_output),
            video_adapter,
            audio_capture,
            Arc::clone(&audio_output),
            audio_adapter,
            Arc::clone(&qos),
        );

        let streamer_as_qos_listener: Arc<dyn QosListener> = streamer.clone();
        let qos_listener: Weak<dyn QosListener> = Arc::downgrade(&streamer_as_qos_listener);
        qos.set_listener(qos_listener);

        let streamer_as_video_callback: Arc<dyn VideoSenderCallback> = streamer.clone();
        let video_callback: Weak<dyn VideoSenderCallback> = Arc::downgrade(&streamer_as_video_callback);
        transport.set_video_callback(video_callback);
        let streamer_as_audio_callback: Arc<dyn AudioSenderCallback> = streamer.clone();
        let audio_callback: Weak<dyn AudioSenderCallback> = Arc::downgrade(&streamer_as_audio_callback);
        transport.set_audio_callback(audio_callback);
        let streamer_as_stats_callback: Arc<dyn StatsCallback> = streamer.clone();
        let stats_callback: Weak<dyn StatsCallback> = Arc::downgrade(&streamer_as_stats_callback);
        transport.set_stats_callback(stats_callback);

        let connection_manager = Arc::new(ConnectionManager {
            max_subscribers: config.network.max_subscribers,
            streamer: Arc::downgrade(&streamer),
        });
        let connection_manager_as_callback: Arc<dyn ConnectionManagerCallback> =
            connection_manager.clone();
        let connection_callback: Weak<dyn ConnectionManagerCallback> =
            Arc::downgrade(&connection_manager_as_callback);
        transport.set_connection_callback(connection_callback);

        let stopped = Arc::new(AtomicBool::new(false));
        let fatal_handler = Arc::new(FatalErrorHandler {
            transport: Arc::downgrade(&transport),
            streamer: Arc::downgrade(&streamer),
            video_output: Arc::downgrade(&video_output),
            audio_output: Arc::downgrade(&audio_output),
            stopped: Arc::clone(&stopped),
        });
        let fatal_handler_as_sink: Arc<dyn FatalErrorSink> = fatal_handler.clone();
        let fatal_sink: Weak<dyn FatalErrorSink> = Arc::downgrade(&fatal_handler_as_sink);
        streamer.set_fatal_error_sink(fatal_sink);

        Ok(Self {
            transport,
            streamer,
            video_output,
            audio_output,
            _connection_manager: connection_manager,
            _fatal_handler: fatal_handler,
            stopped,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.transport.start()?;
        info!("streaming server started");
        Ok(())
    }

    pub fn transport(&self) -> &Arc<ServerTransport> {
        &self.transport
    }

    /// Block until `shutdown` is called from another thread or the process
    /// is killed.
    pub fn wait(&self) {
        while !self.stopped.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    /// Stop everything: transport first (no new work arrives), then the
    /// orchestrator and pipelines. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.shutdown();
        self.streamer.terminate();
        self.video_output.terminate();
        self.audio_output.terminate();
        info!("streaming server stopped");
    }
}

impl Drop for StreamingServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, NetworkConfig, VideoConfig};
    use crate::protocol::service::{Statistics, WireRole};
    use crate::protocol::MediaKind;
    use crate::transport::client::{ClientEvent, ClientTransport};
    use crate::video::frame::SubframeType;
    use std::net::SocketAddr;

    fn test_config(passphrase: Option<&str>) -> AppConfig {
        AppConfig {
            network: NetworkConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 0,
                passphrase: passphrase.map(|p| p.to_string()),
                max_subscribers: 4,
                idle_timeout_secs: 30.0,
                ..Default::default()
            },
            video: VideoConfig {
                width: 64,
                height: 36,
                bitrate: 2_000_000,
                framerate: 120.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn start_server(passphrase: Option<&str>) -> (StreamingServer, SocketAddr) {
        let server = StreamingServer::new(test_config(passphrase)).unwrap();
        server.start().unwrap();
        let addr = server.transport().local_addr().unwrap();
        (server, addr)
    }

    fn handshake(client: &ClientTransport) {
        client.hello("test-client").unwrap();
        let hello = client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::HelloResponse(r) => Some(r),
                _ => None,
            })
            .expect("hello response");
        assert!(hello.accepted);
        assert!(!hello.video_codecs.is_empty());

        client.connect_session(WireRole::Viewer).unwrap();
        let connect = client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::ConnectResponse(r) => Some(r),
                _ => None,
            })
            .expect("connect response");
        assert!(connect.accepted);
    }

    #[test]
    fn test_single_viewer_happy_path() {
        let (server, addr) = start_server(None);
        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);

        client.start(MediaKind::Video, 0).unwrap();
        let init = client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoInit { header, init_block } => Some((header, init_block)),
                _ => None,
            })
            .expect("video init");
        assert!(!init.1.is_empty());
        assert_eq!(init.0.width, 64);

        client.video_init_ack(init.0.init_id, 0).unwrap();

        let mut frames = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while frames.len() < 12 && std::time::Instant::now() < deadline {
            if let Some(event) = client.recv_event(Duration::from_millis(200)) {
                if let ClientEvent::VideoFrame { header, payload } = event {
                    assert!(!payload.is_empty());
                    frames.push(header);
                }
            }
        }
        assert!(frames.len() >= 12, "expected a steady stream of frames");

        // Sequence numbers are strictly consecutive
        for pair in frames.windows(2) {
            assert_eq!(pair[1].frame_num, pair[0].frame_num + 1);
        }
        // The ack forces a key frame near the head of the stream
        assert!(frames
            .iter()
            .take(5)
            .any(|f| f.frame_type == SubframeType::Idr.to_wire()));

        client.stop(Some(MediaKind::Video), 0).unwrap();
        client.disconnect().unwrap();
        server.shutdown();
    }

    #[test]
    fn test_frames_withheld_until_ack() {
        let (server, addr) = start_server(None);
        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);

        client.start(MediaKind::Video, 0).unwrap();
        client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoInit { .. } => Some(()),
                _ => None,
            })
            .expect("video init");

        // No ack sent: no frames may arrive
        let frame = client.wait_for(Duration::from_millis(300), |e| match e {
            ClientEvent::VideoFrame { .. } => Some(()),
            _ => None,
        });
        assert!(frame.is_none());
        server.shutdown();
    }

    #[test]
    fn test_audio_stream_delivery() {
        let (server, addr) = start_server(None);
        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);

        client.start(MediaKind::Audio, 0).unwrap();
        let init = client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::AudioInit { header, .. } => Some(header),
                _ => None,
            })
            .expect("audio init");
        assert_eq!(init.sampling_rate, 48_000);

        client.audio_init_ack(init.init_id, 0).unwrap();

        let mut sequences = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while sequences.len() < 5 && std::time::Instant::now() < deadline {
            if let Some(ClientEvent::AudioBuffer { header, .. }) =
                client.recv_event(Duration::from_millis(200))
            {
                sequences.push(header.sequence);
            }
        }
        assert!(sequences.len() >= 5);
        for pair in sequences.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        server.shutdown();
    }

    #[test]
    fn test_encrypted_session() {
        let (server, addr) = start_server(Some("swordfish"));
        let client = ClientTransport::connect(addr, Some("swordfish")).unwrap();
        handshake(&client);

        client.start(MediaKind::Video, 0).unwrap();
        let init_id = client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoInit { header, .. } => Some(header.init_id),
                _ => None,
            })
            .expect("video init over encrypted link");
        client.video_init_ack(init_id, 0).unwrap();

        let frame = client.wait_for(Duration::from_secs(2), |e| match e {
            ClientEvent::VideoFrame { .. } => Some(()),
            _ => None,
        });
        assert!(frame.is_some());
        server.shutdown();
    }

    #[test]
    fn test_wrong_passphrase_drops_messages_not_session() {
        let (server, addr) = start_server(Some("alpha"));
        let client = ClientTransport::connect(addr, Some("beta")).unwrap();

        client.hello("mismatched").unwrap();
        // The server cannot decrypt the hello: no response, no disconnect
        let response = client.recv_event(Duration::from_millis(300));
        assert!(response.is_none());
        assert_eq!(server.transport().session_count(), 1);
        server.shutdown();
    }

    #[test]
    fn test_discovery_refused_over_capacity() {
        let mut config = test_config(None);
        config.network.max_subscribers = 0;
        let server = StreamingServer::new(config).unwrap();
        server.start().unwrap();
        let addr = server.transport().local_addr().unwrap();

        let client = ClientTransport::connect(addr, None).unwrap();
        client.hello("late-comer").unwrap();
        let hello = client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::HelloResponse(r) => Some(r),
                _ => None,
            })
            .expect("refused discovery still replies");
        assert!(!hello.accepted);
        server.shutdown();
    }

    #[test]
    fn test_idle_session_times_out() {
        let mut config = test_config(None);
        config.network.idle_timeout_secs = 0.4;
        let server = StreamingServer::new(config).unwrap();
        server.start().unwrap();
        let addr = server.transport().local_addr().unwrap();

        let client = ClientTransport::connect(addr, None).unwrap();
        client.hello("sleeper").unwrap();
        client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::HelloResponse(_) => Some(()),
                _ => None,
            })
            .unwrap();

        // Stay silent past the idle timeout; the monitor closes the session
        let disconnected = client.wait_for(Duration::from_secs(3), |e| match e {
            ClientEvent::Disconnected => Some(()),
            _ => None,
        });
        assert!(disconnected.is_some());
        assert_eq!(server.transport().session_count(), 0);
        server.shutdown();
    }

    #[test]
    fn test_stats_reach_qos_without_panic() {
        let (server, addr) = start_server(None);
        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);

        client.start(MediaKind::Video, 0).unwrap();
        let init_id = client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoInit { header, .. } => Some(header.init_id),
                _ => None,
            })
            .unwrap();
        client.video_init_ack(init_id, 0).unwrap();

        // A healthy receiver reporting full-rate stats
        for _ in 0..3 {
            client
                .send_statistics(&Statistics {
                    stream_id: 0,
                    full: 16.0,
                    client: 2.0,
                    server: 2.0,
                    encoder: 4.0,
                    network: 6.0,
                    decoder: 2.0,
                    decoder_queue: 0,
                    framerate: 120.0,
                })
                .unwrap();
            std::thread::sleep(Duration::from_millis(50));
        }
        // The stream keeps flowing
        let frame = client.wait_for(Duration::from_secs(2), |e| match e {
            ClientEvent::VideoFrame { .. } => Some(()),
            _ => None,
        });
        assert!(frame.is_some());
        server.shutdown();
    }

    #[test]
    fn test_force_update_produces_key_frame() {
        let (server, addr) = start_server(None);
        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);
        client.start(MediaKind::Video, 0).unwrap();
        let init_id = client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoInit { header, .. } => Some(header.init_id),
                _ => None,
            })
            .unwrap();
        client.video_init_ack(init_id, 0).unwrap();

        // Sync to a key frame, then drain a few delta frames into the GOP
        client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoFrame { header, .. }
                    if header.frame_type == SubframeType::Idr.to_wire() =>
                {
                    Some(())
                }
                _ => None,
            })
            .expect("initial key frame");
        for _ in 0..5 {
            client.wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoFrame { .. } => Some(()),
                _ => None,
            });
        }

        client.request_force_update(0).unwrap();

        // The forced IDR must arrive well before the natural GOP boundary
        let mut saw_idr = false;
        for _ in 0..15 {
            let frame = client.wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoFrame { header, .. } => Some(header),
                _ => None,
            });
            if frame.is_some_and(|f| f.frame_type == SubframeType::Idr.to_wire()) {
                saw_idr = true;
                break;
            }
        }
        assert!(saw_idr, "force update must yield a key frame");
        server.shutdown();
    }

    #[test]
    fn test_receiver_requested_bitrate_change() {
        use crate::protocol::service::UpdateRequest;

        let (server, addr) = start_server(None);
        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);
        client.start(MediaKind::Video, 0).unwrap();
        client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoInit { .. } => Some(()),
                _ => None,
            })
            .unwrap();

        client
            .request_stream_update(&UpdateRequest {
                stream_id: 0,
                bitrate: Some(8_000_000),
                ..Default::default()
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.video_output.bitrate() != 8_000_000
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(server.video_output.bitrate(), 8_000_000);
        server.shutdown();
    }

    #[test]
    fn test_cursor_broadcast_reaches_video_subscribers() {
        use crate::video::cursor::{Cursor, CursorKind};
        use crate::video::format::Resolution;
        use bytes::Bytes;

        let (server, addr) = start_server(None);
        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);
        client.start(MediaKind::Video, 0).unwrap();
        client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoInit { .. } => Some(()),
                _ => None,
            })
            .unwrap();

        server
            .transport()
            .broadcast_cursor(&Cursor {
                bitmap: Bytes::from_static(&[0xAA; 64]),
                resolution: Resolution::new(32, 32),
                hotspot: (4, 2),
                capture_resolution: Resolution::new(1920, 1080),
                kind: CursorKind::Color,
            })
            .unwrap();

        let cursor = client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::Cursor { header, bitmap } => Some((header, bitmap)),
                _ => None,
            })
            .expect("cursor update");
        assert_eq!(cursor.0.hotspot_x, 4);
        assert_eq!(cursor.1.len(), 64);
        server.shutdown();
    }

    #[test]
    fn test_controller_demotion_and_promotion() {
        let (server, addr) = start_server(None);

        let first = ClientTransport::connect(addr, None).unwrap();
        first.hello("controller-1").unwrap();
        first
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::HelloResponse(_) => Some(()),
                _ => None,
            })
            .unwrap();
        first.connect_session(WireRole::Controller).unwrap();
        first
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::ConnectResponse(r) => Some(r),
                _ => None,
            })
            .unwrap();

        let second = ClientTransport::connect(addr, None).unwrap();
        second.hello("controller-2").unwrap();
        second
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::HelloResponse(_) => Some(()),
                _ => None,
            })
            .unwrap();
        second.connect_session(WireRole::Controller).unwrap();
        let response = second
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::ConnectResponse(r) => Some(r),
                _ => None,
            })
            .unwrap();
        // A second controller is demoted, not refused
        assert!(response.accepted);

        let wait_for_origin = |expected: i64| {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while std::time::Instant::now() < deadline {
                if server.streamer.last_origin_pts() == expected {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            false
        };

        first.send_origin_pts(111).unwrap();
        assert!(wait_for_origin(111));

        // The demoted controller's submissions are ignored
        second.send_origin_pts(222).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(server.streamer.last_origin_pts(), 111);

        // When the active controller leaves, the earliest remaining one is
        // promoted and its submissions start counting
        first.disconnect().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        second.send_origin_pts(333).unwrap();
        assert!(wait_for_origin(333));
        server.shutdown();
    }

    #[test]
    fn test_udp_discovery_round_trip() {
        use crate::protocol::framing::{decode_datagram, decode_message, encode_datagram, encode_message};
        use crate::protocol::service::Hello;
        use crate::protocol::{Channel, ServiceOpcode};
        use crate::transport::server::TransportProtocol;

        let mut config = test_config(None);
        config.network.protocol = TransportProtocol::Udp;
        let server = StreamingServer::new(config).unwrap();
        server.start().unwrap();
        let addr = server.transport().local_addr().unwrap();

        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let hello = encode_message(
            ServiceOpcode::Hello as u8,
            &Hello {
                client_id: "udp-client".to_string(),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        socket
            .send_to(&encode_datagram(Channel::Service, &hello), addr)
            .unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        let (channel, message) = decode_datagram(&buf[..n]).unwrap();
        assert_eq!(channel, Channel::Service);
        let envelope = decode_message(message).unwrap();
        assert_eq!(envelope.opcode, ServiceOpcode::HelloResponse as u8);
        let response: crate::protocol::service::HelloResponse =
            envelope.parse_body().unwrap();
        assert!(response.accepted);
        server.shutdown();
    }

    #[test]
    fn test_capture_failure_stops_whole_instance() {
        struct DeadVideoSource;

        impl crate::capture::VideoCaptureSource for DeadVideoSource {
            fn take_sample(
                &mut self,
            ) -> crate::error::Result<Option<crate::video::VideoSurface>> {
                Err(StreamError::Video("capture device lost".to_string()))
            }

            fn set_framerate(&mut self, _framerate: f32) {}
        }

        let audio_params = AudioStreamParams::default();
        let server = StreamingServer::with_components(
            test_config(None),
            Box::new(DeadVideoSource),
            Box::new(LoopbackEncoder::new(60)),
            Box::new(SyntheticAudioSource::new(audio_params)),
            Some(Box::new(LoopbackAudioEncoder::new(audio_params))),
        )
        .unwrap();
        server.start().unwrap();
        let addr = server.transport().local_addr().unwrap();

        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);

        // Audio subscription keeps the sibling capture thread running so the
        // teardown provably stops it too
        client.start(MediaKind::Audio, 0).unwrap();
        client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::AudioInit { .. } => Some(()),
                _ => None,
            })
            .unwrap();
        assert!(server.streamer.is_audio_capture_running());

        // The video subscription starts the dead source; its first poll
        // fails and the whole instance comes down
        client.start(MediaKind::Video, 0).unwrap();

        let disconnected = client.wait_for(Duration::from_secs(3), |e| match e {
            ClientEvent::Disconnected => Some(()),
            _ => None,
        });
        assert!(disconnected.is_some(), "all sessions must be terminated");

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !server.stopped.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(server.stopped.load(Ordering::SeqCst), "instance must stop");
        assert!(!server.streamer.is_video_capture_running());
        assert!(!server.streamer.is_audio_capture_running());
        assert_eq!(server.transport().session_count(), 0);
        // wait() returns immediately once the instance is down
        server.wait();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (server, addr) = start_server(None);
        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);
        server.shutdown();
        server.shutdown();
        drop(client);
    }

    #[test]
    fn test_disconnect_stops_capture() {
        let (server, addr) = start_server(None);
        let client = ClientTransport::connect(addr, None).unwrap();
        handshake(&client);

        client.start(MediaKind::Video, 0).unwrap();
        client
            .wait_for(Duration::from_secs(2), |e| match e {
                ClientEvent::VideoInit { .. } => Some(()),
                _ => None,
            })
            .unwrap();
        assert!(server.streamer.is_video_capture_running());

        client.disconnect().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.streamer.is_video_capture_running()
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!server.streamer.is_video_capture_running());
        server.shutdown();
    }
}
