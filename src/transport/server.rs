//! Server transport
//!
//! Owns every session: listens for peers over TCP or UDP, runs the
//! discovery/connect/subscribe handshake, dispatches inbound control
//! messages to the registered callbacks, and implements the send surface
//! the transmitter adapters fan out through. A periodic monitor sweep
//! terminates sessions that have gone silent.
//!
//! The transport mutex protects the session and address maps only; all
//! per-session counters live under the session's own lock so streaming
//! sessions do not serialize on a global one.

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::audio::buffer::TransmittableAudioBuffer;
use crate::audio::format::AudioStreamParams;
use crate::error::{Result, StreamError};
use crate::protocol::framing::{
    decode_datagram, decode_message, encode_message, Envelope, StreamDecoder,
};
use crate::protocol::service::{
    Connect, ConnectResponse, Disconnect, Hello, HelloResponse, OriginPts, Start, Statistics, Stop,
    UpdateRequest, WireRole,
};
use crate::protocol::video::{CursorData, VideoData, VideoForceUpdate, VideoInit, VideoInitAck,
    VideoInitRequest,
};
use crate::protocol::audio::{AudioData, AudioInit, AudioInitAck, AudioInitRequest};
use crate::protocol::{
    AudioOpcode, Channel, MediaKind, SensorsOpcode, ServiceOpcode, VideoOpcode, PROTOCOL_VERSION,
};
use crate::transport::cipher::{plaintext_signature_ok, AesPskCipher};
use crate::transport::session::{Session, SessionLink, SessionState};
use crate::transport::{
    AudioSenderCallback, ClientRole, ConnectionManagerCallback, FrameSink, ReceiverStats,
    SessionHandle, StatsCallback, StreamId, TerminationReason, VideoSenderCallback,
    VideoStreamDescriptor,
};
use crate::utils::clock::{now_pts, secs_to_pts, PTS_PER_MILLISECOND};
use crate::video::cursor::Cursor;
use crate::video::format::Resolution;
use crate::video::frame::TransmittableVideoFrame;

/// Transport flavor for the single listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone)]
pub struct ServerTransportConfig {
    pub bind_address: String,
    pub port: u16,
    pub protocol: TransportProtocol,
    pub passphrase: Option<String>,
    pub idle_timeout_secs: f32,
    /// Advertised in the discovery reply
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub default_resolution: Resolution,
    pub default_bitrate: i64,
    pub default_framerate: f32,
    pub audio_channels: u32,
    pub audio_layout: u32,
    pub sampling_rate: u32,
}

impl Default for ServerTransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 1235,
            protocol: TransportProtocol::Tcp,
            passphrase: None,
            idle_timeout_secs: 10.0,
            video_codecs: vec!["h264".to_string()],
            audio_codecs: vec!["aac".to_string()],
            default_resolution: Resolution::HD1080,
            default_bitrate: 20_000_000,
            default_framerate: 60.0,
            audio_channels: 2,
            audio_layout: 0x3,
            sampling_rate: 48_000,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    video: Mutex<Option<Weak<dyn VideoSenderCallback>>>,
    audio: Mutex<Option<Weak<dyn AudioSenderCallback>>>,
    stats: Mutex<Option<Weak<dyn StatsCallback>>>,
    connection: Mutex<Option<Weak<dyn ConnectionManagerCallback>>>,
}

struct TransportState {
    sessions: HashMap<SessionHandle, Arc<Session>>,
    by_addr: HashMap<SocketAddr, SessionHandle>,
    active_controller: Option<SessionHandle>,
}

pub struct ServerTransport {
    config: ServerTransportConfig,
    cipher: Option<Arc<AesPskCipher>>,
    state: Mutex<TransportState>,
    callbacks: Callbacks,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    udp_socket: Mutex<Option<Arc<UdpSocket>>>,
    bound_addr: Mutex<Option<SocketAddr>>,
    next_handle: AtomicI64,
    running: AtomicBool,
}

impl ServerTransport {
    pub fn new(config: ServerTransportConfig) -> Arc<Self> {
        let cipher = config
            .passphrase
            .as_deref()
            .map(|passphrase| Arc::new(AesPskCipher::new(passphrase)));
        Arc::new(Self {
            config,
            cipher,
            state: Mutex::new(TransportState {
                sessions: HashMap::new(),
                by_addr: HashMap::new(),
                active_controller: None,
            }),
            callbacks: Callbacks::default(),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            udp_socket: Mutex::new(None),
            bound_addr: Mutex::new(None),
            next_handle: AtomicI64::new((rand::random::<u32>() % 1_000_000) as i64 + 1),
            running: AtomicBool::new(false),
        })
    }

    pub fn set_video_callback(&self, callback: Weak<dyn VideoSenderCallback>) {
        *self.callbacks.video.lock() = Some(callback);
    }

    pub fn set_audio_callback(&self, callback: Weak<dyn AudioSenderCallback>) {
        *self.callbacks.audio.lock() = Some(callback);
    }

    pub fn set_stats_callback(&self, callback: Weak<dyn StatsCallback>) {
        *self.callbacks.stats.lock() = Some(callback);
    }

    pub fn set_connection_callback(&self, callback: Weak<dyn ConnectionManagerCallback>) {
        *self.callbacks.connection.lock() = Some(callback);
    }

    /// Actual bound address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    fn video_callback(&self) -> Option<Arc<dyn VideoSenderCallback>> {
        self.callbacks.video.lock().as_ref().and_then(|w| w.upgrade())
    }

    fn audio_callback(&self) -> Option<Arc<dyn AudioSenderCallback>> {
        self.callbacks.audio.lock().as_ref().and_then(|w| w.upgrade())
    }

    fn stats_callback(&self) -> Option<Arc<dyn StatsCallback>> {
        self.callbacks.stats.lock().as_ref().and_then(|w| w.upgrade())
    }

    fn connection_callback(&self) -> Option<Arc<dyn ConnectionManagerCallback>> {
        self.callbacks
            .connection
            .lock()
            .as_ref()
            .and_then(|w| w.upgrade())
    }

    /// Bind the socket and start the listener, receive and monitor threads.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadyInitialized("server transport".to_string()));
        }
        match self.bind_and_spawn() {
            Ok(()) => Ok(()),
            Err(e) => {
                // A failed bind leaves the transport startable again
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn bind_and_spawn(self: &Arc<Self>) -> Result<()> {
        self.stop.store(false, Ordering::SeqCst);
        let bind = format!("{}:{}", self.config.bind_address, self.config.port);

        match self.config.protocol {
            TransportProtocol::Tcp => {
                let listener = TcpListener::bind(&bind)
                    .map_err(|e| StreamError::PortBusy(format!("{}: {}", bind, e)))?;
                listener
                    .set_nonblocking(true)
                    .map_err(StreamError::Io)?;
                *self.bound_addr.lock() = listener.local_addr().ok();
                info!(%bind, "server transport listening (tcp)");
                let transport = Arc::clone(self);
                self.spawn("transport-accept", move || transport.accept_loop(listener));
            }
            TransportProtocol::Udp => {
                let socket = UdpSocket::bind(&bind)
                    .map_err(|e| StreamError::PortBusy(format!("{}: {}", bind, e)))?;
                socket
                    .set_read_timeout(Some(Duration::from_millis(100)))
                    .map_err(StreamError::Io)?;
                let socket = Arc::new(socket);
                *self.udp_socket.lock() = Some(Arc::clone(&socket));
                *self.bound_addr.lock() = socket.local_addr().ok();
                info!(%bind, "server transport listening (udp)");
                let transport = Arc::clone(self);
                self.spawn("transport-receive", move || transport.udp_receive_loop(socket));
            }
        }

        let transport = Arc::clone(self);
        self.spawn("session-monitor", move || transport.monitor_loop());
        Ok(())
    }

    /// Terminate every session and join all transport threads. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);

        let handles: Vec<SessionHandle> = self.state.lock().sessions.keys().copied().collect();
        for handle in handles {
            self.terminate_session(handle, TerminationReason::Disconnect);
        }

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for thread in threads {
            let _ = thread.join();
        }
        *self.udp_socket.lock() = None;
        info!("server transport stopped");
    }

    fn spawn<F: FnOnce() + Send + 'static>(&self, name: &str, f: F) {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .expect("failed to spawn transport thread");
        self.threads.lock().push(handle);
    }

    fn next_session_handle(&self) -> SessionHandle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Receive paths

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        while !self.stop.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.setup_tcp_session(stream, peer) {
                        warn!(%peer, error = %e, "failed to set up session");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    if !self.stop.load(Ordering::Relaxed) {
                        error!(error = %e, "accept failed");
                    }
                    break;
                }
            }
        }
    }

    fn setup_tcp_session(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true).map_err(StreamError::Io)?;
        let read_stream = stream.try_clone().map_err(StreamError::Io)?;
        read_stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(StreamError::Io)?;

        let handle = self.next_session_handle();
        let session = Session::new(
            handle,
            peer,
            SessionLink::Tcp(Mutex::new(stream)),
            self.cipher.clone(),
        );
        {
            let mut state = self.state.lock();
            state.sessions.insert(handle, Arc::clone(&session));
            state.by_addr.insert(peer, handle);
        }
        info!(session = handle, %peer, "peer connected");

        let transport = Arc::clone(self);
        self.spawn("transport-receive", move || {
            transport.tcp_receive_loop(session, read_stream)
        });
        Ok(())
    }

    fn tcp_receive_loop(self: Arc<Self>, session: Arc<Session>, mut stream: TcpStream) {
        let mut decoder = StreamDecoder::new();
        let mut pending = BytesMut::with_capacity(64 * 1024);
        let mut read_buf = [0u8; 64 * 1024];

        while !self.stop.load(Ordering::Relaxed) {
            match stream.read(&mut read_buf) {
                Ok(0) => {
                    debug!(session = session.handle, "peer closed connection");
                    self.terminate_session(session.handle, TerminationReason::Disconnect);
                    return;
                }
                Ok(n) => {
                    pending.extend_from_slice(&read_buf[..n]);
                    loop {
                        match decoder.decode(&mut pending) {
                            Ok(Some((channel, message))) => {
                                self.handle_raw_message(&session, channel, &message);
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(session = session.handle, error = %e, "stream framing error, dropping session");
                                self.terminate_session(session.handle, TerminationReason::Disconnect);
                                return;
                            }
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if self.state.lock().sessions.get(&session.handle).is_none() {
                        // Session was torn down elsewhere (timeout sweep)
                        return;
                    }
                }
                Err(e) => {
                    if !self.stop.load(Ordering::Relaxed) {
                        debug!(session = session.handle, error = %e, "read failed");
                        self.terminate_session(session.handle, TerminationReason::Disconnect);
                    }
                    return;
                }
            }
        }
    }

    fn udp_receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; 65_536];
        while !self.stop.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    let session = self.session_for_datagram(peer, &socket);
                    match decode_datagram(&buf[..n]) {
                        Ok((channel, message)) => {
                            self.handle_raw_message(&session, channel, message)
                        }
                        Err(e) => {
                            warn!(%peer, error = %e, "bad datagram dropped");
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    if !self.stop.load(Ordering::Relaxed) {
                        error!(error = %e, "udp receive failed");
                    }
                    break;
                }
            }
        }
    }

    fn session_for_datagram(&self, peer: SocketAddr, socket: &Arc<UdpSocket>) -> Arc<Session> {
        {
            let state = self.state.lock();
            if let Some(handle) = state.by_addr.get(&peer) {
                if let Some(session) = state.sessions.get(handle) {
                    return Arc::clone(session);
                }
            }
        }
        let handle = self.next_session_handle();
        let session = Session::new(
            handle,
            peer,
            SessionLink::Udp {
                socket: Arc::clone(socket),
                peer,
            },
            self.cipher.clone(),
        );
        let mut state = self.state.lock();
        state.sessions.insert(handle, Arc::clone(&session));
        state.by_addr.insert(peer, handle);
        info!(session = handle, %peer, "peer connected");
        session
    }

    // ------------------------------------------------------------------
    // Dispatch

    fn handle_raw_message(&self, session: &Arc<Session>, channel: Channel, message: &[u8]) {
        let decrypted;
        let plaintext: &[u8] = match &self.cipher {
            Some(cipher) => {
                match cipher.decrypt(message) {
                    Ok(clear) => {
                        decrypted = clear;
                        &decrypted
                    }
                    Err(e) => {
                        // Key mismatch or corruption: drop the message, keep
                        // the session (the client may resend)
                        warn!(session = session.handle, error = %e, "message decryption failed, dropped");
                        return;
                    }
                }
            }
            None => message,
        };
        if !plaintext_signature_ok(plaintext) {
            warn!(
                session = session.handle,
                ?channel,
                "passphrase signature check failed, message dropped"
            );
            return;
        }

        session.touch();
        let envelope = match decode_message(plaintext) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session = session.handle, error = %e, "malformed message dropped");
                return;
            }
        };

        let dispatch = match channel {
            Channel::Service => self.handle_service_message(session, &envelope),
            Channel::VideoIn => self.handle_video_message(session, &envelope),
            Channel::AudioIn => self.handle_audio_message(session, &envelope),
            Channel::SensorsIn => self.handle_sensors_message(session, &envelope),
            Channel::UserDefined => {
                debug!(session = session.handle, "user-defined message ignored");
                Ok(())
            }
            Channel::VideoOut | Channel::AudioOut | Channel::SensorsOut => {
                Err(StreamError::InvalidMessage(format!(
                    "unexpected inbound channel {:?}",
                    channel
                )))
            }
        };
        if let Err(e) = dispatch {
            warn!(session = session.handle, ?channel, error = %e, "message dropped");
        }
    }

    fn handle_service_message(&self, session: &Arc<Session>, envelope: &Envelope) -> Result<()> {
        let opcode = ServiceOpcode::from_wire(envelope.opcode).ok_or_else(|| {
            StreamError::InvalidMessage(format!("unknown service opcode {}", envelope.opcode))
        })?;
        match opcode {
            ServiceOpcode::Hello => {
                let hello: Hello = envelope.parse_body()?;
                self.handle_hello(session, &hello)
            }
            ServiceOpcode::Connect => {
                let connect: Connect = envelope.parse_body()?;
                self.handle_connect(session, &connect)
            }
            ServiceOpcode::Start => {
                let start: Start = envelope.parse_body()?;
                self.handle_start(session, &start)
            }
            ServiceOpcode::Stop => {
                let stop: Stop = envelope.parse_body()?;
                self.handle_stop(session, &stop);
                Ok(())
            }
            ServiceOpcode::Statistics => {
                let stats: Statistics = envelope.parse_body()?;
                self.handle_statistics(session, &stats);
                Ok(())
            }
            ServiceOpcode::Disconnect => {
                let _: Disconnect = envelope.parse_body()?;
                info!(session = session.handle, "peer requested disconnect");
                self.terminate_session(session.handle, TerminationReason::Disconnect);
                Ok(())
            }
            ServiceOpcode::Update => {
                let update: UpdateRequest = envelope.parse_body()?;
                self.handle_update(session, &update);
                Ok(())
            }
            ServiceOpcode::HelloResponse | ServiceOpcode::ConnectResponse => Err(
                StreamError::InvalidMessage("server received a reply opcode".to_string()),
            ),
        }
    }

    fn handle_hello(&self, session: &Arc<Session>, hello: &Hello) -> Result<()> {
        let subscriber_count = {
            let state = self.state.lock();
            state
                .sessions
                .values()
                .filter(|s| s.state() >= SessionState::Connected)
                .count()
        };
        let accepted = self
            .connection_callback()
            .map(|cb| cb.on_discovery_request(subscriber_count))
            .unwrap_or(false);

        info!(
            session = session.handle,
            client = %hello.client_id,
            accepted,
            "discovery request"
        );
        if accepted {
            session.set_state(SessionState::Discovered);
        }

        // A refused discovery still gets a reply
        let response = HelloResponse {
            protocol_version: PROTOCOL_VERSION,
            port: self.config.port,
            accepted,
            video_codecs: self.config.video_codecs.clone(),
            audio_codecs: self.config.audio_codecs.clone(),
            width: self.config.default_resolution.width,
            height: self.config.default_resolution.height,
            bitrate: self.config.default_bitrate,
            framerate: self.config.default_framerate,
            audio_channels: self.config.audio_channels,
            audio_layout: self.config.audio_layout,
            sampling_rate: self.config.sampling_rate,
            cipher: self.cipher.is_some(),
        };
        self.send_to_session(session, Channel::Service, ServiceOpcode::HelloResponse as u8, &response, None)
    }

    fn handle_connect(&self, session: &Arc<Session>, connect: &Connect) -> Result<()> {
        if session.state() != SessionState::Discovered {
            return Err(StreamError::InvalidMessage(
                "connect before discovery".to_string(),
            ));
        }
        let role = match connect.role {
            WireRole::Viewer => ClientRole::Viewer,
            WireRole::Controller => ClientRole::Controller,
        };
        let accepted = self
            .connection_callback()
            .map(|cb| cb.on_connection_request(session.handle, role))
            .unwrap_or(false);

        if accepted {
            session.set_role(role);
            session.set_state(SessionState::Connected);
            if role == ClientRole::Controller {
                let mut state = self.state.lock();
                match state.active_controller {
                    None => {
                        state.active_controller = Some(session.handle);
                        session.set_demoted(false);
                    }
                    Some(_) => {
                        // One controller per stream; later ones are demoted
                        // (accepted, but their pose submissions are ignored)
                        session.set_demoted(true);
                        warn!(
                            session = session.handle,
                            "additional controller demoted"
                        );
                    }
                }
            }
            info!(session = session.handle, ?role, "connection accepted");
        } else {
            info!(session = session.handle, ?role, "connection refused");
        }

        let response = ConnectResponse {
            accepted,
            reason: (!accepted).then(|| "server refused connection".to_string()),
        };
        self.send_to_session(session, Channel::Service, ServiceOpcode::ConnectResponse as u8, &response, None)
    }

    fn handle_start(&self, session: &Arc<Session>, start: &Start) -> Result<()> {
        if session.state() < SessionState::Connected {
            return Err(StreamError::InvalidMessage(
                "start before connect".to_string(),
            ));
        }
        session.set_state(SessionState::Subscribed);
        match start.kind {
            MediaKind::Video => {
                session.subscribed_video.store(true, Ordering::Relaxed);
                if let Some(cb) = self.video_callback() {
                    cb.on_video_stream_subscribed(session.handle, start.stream_id);
                }
            }
            MediaKind::Audio => {
                session.subscribed_audio.store(true, Ordering::Relaxed);
                if let Some(cb) = self.audio_callback() {
                    cb.on_audio_stream_subscribed(session.handle, start.stream_id);
                }
            }
        }
        Ok(())
    }

    fn handle_stop(&self, session: &Arc<Session>, stop: &Stop) {
        let stop_video = stop.kind.is_none() || stop.kind == Some(MediaKind::Video);
        let stop_audio = stop.kind.is_none() || stop.kind == Some(MediaKind::Audio);

        if stop_video && session.subscribed_video.swap(false, Ordering::Relaxed) {
            if let Some(cb) = self.video_callback() {
                cb.on_video_stream_unsubscribed(session.handle, stop.stream_id);
            }
        }
        if stop_audio && session.subscribed_audio.swap(false, Ordering::Relaxed) {
            if let Some(cb) = self.audio_callback() {
                cb.on_audio_stream_unsubscribed(session.handle, stop.stream_id);
            }
        }
        if !session.subscribed_video.load(Ordering::Relaxed)
            && !session.subscribed_audio.load(Ordering::Relaxed)
            && session.state() == SessionState::Subscribed
        {
            session.set_state(SessionState::Connected);
        }
    }

    fn handle_update(&self, session: &Arc<Session>, update: &UpdateRequest) {
        let Some(cb) = self.video_callback() else {
            return;
        };
        if let Some(bitrate) = update.bitrate {
            cb.on_bitrate_change_request(session.handle, update.stream_id, bitrate);
        }
        if let Some(framerate) = update.framerate {
            cb.on_framerate_change_request(session.handle, update.stream_id, framerate);
        }
        if let (Some(width), Some(height)) = (update.width, update.height) {
            cb.on_resolution_change_request(
                session.handle,
                update.stream_id,
                Resolution::new(width, height),
            );
        }
    }

    fn handle_statistics(&self, session: &Arc<Session>, stats: &Statistics) {
        let receiver_stats = ReceiverStats {
            full_latency: stats.full,
            client_latency: stats.client,
            server_latency: stats.server,
            encoder_latency: stats.encoder,
            network_latency: stats.network,
            decoder_latency: stats.decoder,
            receiver_framerate: stats.framerate,
            decoder_queue_depth: stats.decoder_queue,
            key_frame_req_count: session.force_idr_request_count(),
            worst_send_time: session.take_worst_send_time(),
            last_stats_time: now_pts(),
        };
        if let Some(cb) = self.stats_callback() {
            cb.on_receiver_stats(session.handle, stats.stream_id, &receiver_stats);
        }
    }

    fn handle_video_message(&self, session: &Arc<Session>, envelope: &Envelope) -> Result<()> {
        let opcode = VideoOpcode::from_wire(envelope.opcode).ok_or_else(|| {
            StreamError::InvalidMessage(format!("unknown video opcode {}", envelope.opcode))
        })?;
        match opcode {
            VideoOpcode::InitAck => {
                let ack: VideoInitAck = envelope.parse_body()?;
                if let Some(cb) = self.video_callback() {
                    cb.on_ready_to_receive_video(session.handle, ack.stream_id, ack.init_id);
                }
                Ok(())
            }
            VideoOpcode::ForceUpdate => {
                let force: VideoForceUpdate = envelope.parse_body()?;
                let count = session.count_force_idr_request();
                debug!(session = session.handle, count, "force update requested");
                if let Some(cb) = self.video_callback() {
                    cb.on_force_update_request(force.stream_id);
                }
                Ok(())
            }
            VideoOpcode::InitRequest => {
                let request: VideoInitRequest = envelope.parse_body()?;
                if let Some(cb) = self.video_callback() {
                    cb.on_video_request_init(session.handle, request.stream_id);
                }
                Ok(())
            }
            VideoOpcode::Init | VideoOpcode::Data | VideoOpcode::Cursor => Err(
                StreamError::InvalidMessage("server received an outbound video opcode".to_string()),
            ),
        }
    }

    fn handle_audio_message(&self, session: &Arc<Session>, envelope: &Envelope) -> Result<()> {
        let opcode = AudioOpcode::from_wire(envelope.opcode).ok_or_else(|| {
            StreamError::InvalidMessage(format!("unknown audio opcode {}", envelope.opcode))
        })?;
        match opcode {
            AudioOpcode::InitAck => {
                let ack: AudioInitAck = envelope.parse_body()?;
                if let Some(cb) = self.audio_callback() {
                    cb.on_ready_to_receive_audio(session.handle, ack.stream_id, ack.init_id);
                }
                Ok(())
            }
            AudioOpcode::InitRequest => {
                let request: AudioInitRequest = envelope.parse_body()?;
                if let Some(cb) = self.audio_callback() {
                    cb.on_audio_request_init(session.handle, request.stream_id);
                }
                Ok(())
            }
            AudioOpcode::Init | AudioOpcode::Data => Err(StreamError::InvalidMessage(
                "server received an outbound audio opcode".to_string(),
            )),
        }
    }

    fn handle_sensors_message(&self, session: &Arc<Session>, envelope: &Envelope) -> Result<()> {
        let opcode = SensorsOpcode::from_wire(envelope.opcode).ok_or_else(|| {
            StreamError::InvalidMessage(format!("unknown sensors opcode {}", envelope.opcode))
        })?;
        match opcode {
            SensorsOpcode::OriginPts => {
                let origin: OriginPts = envelope.parse_body()?;
                // Only the active controller drives the latency probe
                if session.role() == ClientRole::Controller && !session.is_demoted() {
                    if let Some(cb) = self.stats_callback() {
                        cb.on_origin_pts(
                            session.handle,
                            crate::transport::DEFAULT_STREAM,
                            origin.origin_pts,
                        );
                    }
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Tear down one session. Idempotent; safe from any thread.
    pub fn terminate_session(&self, handle: SessionHandle, reason: TerminationReason) {
        let (session, promoted) = {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.remove(&handle) else {
                return;
            };
            state.by_addr.remove(&session.peer);

            // Promote the earliest-connected remaining controller when the
            // active one leaves
            let mut promoted = None;
            if state.active_controller == Some(handle) {
                state.active_controller = None;
                let successor = state
                    .sessions
                    .values()
                    .filter(|s| s.role() == ClientRole::Controller)
                    .min_by_key(|s| s.created_at)
                    .map(|s| Arc::clone(s));
                if let Some(successor) = successor {
                    state.active_controller = Some(successor.handle);
                    promoted = Some(successor);
                }
            }
            (session, promoted)
        };

        if let Some(successor) = promoted {
            successor.set_demoted(false);
            info!(session = successor.handle, "controller promoted");
        }

        session.set_state(SessionState::Terminated);
        session.shutdown_link();
        info!(session = handle, ?reason, "session terminated");

        if let Some(cb) = self.connection_callback() {
            cb.on_session_terminated(handle, reason);
        }
    }

    fn monitor_loop(self: Arc<Self>) {
        let idle_timeout = secs_to_pts(self.config.idle_timeout_secs);
        while !self.stop.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(250));
            if idle_timeout <= 0 {
                continue;
            }
            let now = now_pts();
            let expired: Vec<SessionHandle> = {
                let state = self.state.lock();
                state
                    .sessions
                    .values()
                    .filter(|s| now - s.last_seen() > idle_timeout)
                    .map(|s| s.handle)
                    .collect()
            };
            for handle in expired {
                warn!(session = handle, "session idle timeout");
                self.terminate_session(handle, TerminationReason::Timeout);
            }
        }
    }

    // ------------------------------------------------------------------
    // Send paths

    fn session(&self, handle: SessionHandle) -> Result<Arc<Session>> {
        self.state
            .lock()
            .sessions
            .get(&handle)
            .cloned()
            .ok_or_else(|| StreamError::InvalidArg(format!("unknown session {}", handle)))
    }

    fn send_to_session<T: Serialize>(
        &self,
        session: &Arc<Session>,
        channel: Channel,
        opcode: u8,
        body: &T,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        let message = encode_message(opcode, body, payload)?;
        match session.send_message(channel, &message) {
            Ok(()) => Ok(()),
            Err(StreamError::Io(e)) => {
                // A session-level I/O failure takes down this session only
                debug!(session = session.handle, error = %e, "send failed, terminating session");
                self.terminate_session(session.handle, TerminationReason::Disconnect);
                Err(StreamError::Io(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Broadcast a cursor update to every video subscriber.
    pub fn broadcast_cursor(&self, cursor: &Cursor) -> Result<()> {
        let targets: Vec<Arc<Session>> = {
            let state = self.state.lock();
            state
                .sessions
                .values()
                .filter(|s| s.subscribed_video.load(Ordering::Relaxed))
                .cloned()
                .collect()
        };
        let body = CursorData {
            width: cursor.resolution.width,
            height: cursor.resolution.height,
            hotspot_x: cursor.hotspot.0,
            hotspot_y: cursor.hotspot.1,
            capture_width: cursor.capture_resolution.width,
            capture_height: cursor.capture_resolution.height,
            kind: cursor.kind.to_wire(),
            visible: true,
        };
        let mut result = Ok(());
        for session in targets {
            if let Err(e) = self.send_to_session(
                &session,
                Channel::VideoOut,
                VideoOpcode::Cursor as u8,
                &body,
                Some(&cursor.bitmap),
            ) {
                result = Err(e);
            }
        }
        result
    }
}

impl FrameSink for ServerTransport {
    fn send_video_init(
        &self,
        session: SessionHandle,
        codec: &str,
        stream_id: StreamId,
        init_id: crate::transport::InitId,
        descriptor: &VideoStreamDescriptor,
        init_block: &[u8],
    ) -> Result<()> {
        let session = self.session(session)?;
        let body = VideoInit {
            codec: codec.to_string(),
            init_id,
            stream_id,
            width: descriptor.resolution.width,
            height: descriptor.resolution.height,
            viewport: descriptor.viewport,
            bit_depth: descriptor.bit_depth,
            stereoscopic: descriptor.stereoscopic,
            foveated: descriptor.foveated,
        };
        self.send_to_session(
            &session,
            Channel::VideoOut,
            VideoOpcode::Init as u8,
            &body,
            Some(init_block),
        )
    }

    fn send_video_frame(
        &self,
        session: SessionHandle,
        stream_id: StreamId,
        frame: &TransmittableVideoFrame,
    ) -> Result<()> {
        let session = self.session(session)?;
        let now = now_pts();
        // One message per subframe; the receiver reassembles by pts
        for subframe in frame.subframes() {
            let body = VideoData {
                pts: frame.pts(),
                origin_pts: frame.origin_pts(),
                server_latency: now - frame.origin_pts(),
                encoder_latency: frame.encoder_latency(),
                frame_size: subframe.data.len() as u32,
                view_type: frame.view_type().to_wire(),
                frame_type: subframe.subframe_type.to_wire(),
                send_duration: (session.last_send_time() * PTS_PER_MILLISECOND as f32) as i64,
                frame_num: frame.sequence(),
                duration: frame.duration(),
                discontinuity: frame.discontinuity(),
                stream_id,
            };
            self.send_to_session(
                &session,
                Channel::VideoOut,
                VideoOpcode::Data as u8,
                &body,
                Some(&subframe.data),
            )?;
        }
        Ok(())
    }

    fn send_audio_init(
        &self,
        session: SessionHandle,
        codec: &str,
        stream_id: StreamId,
        init_id: crate::transport::InitId,
        params: &AudioStreamParams,
        init_block: &[u8],
    ) -> Result<()> {
        let session = self.session(session)?;
        let body = AudioInit {
            codec: codec.to_string(),
            init_id,
            stream_id,
            channels: params.channels,
            layout: params.layout.0,
            format: params.format.to_wire(),
            sampling_rate: params.sampling_rate,
        };
        self.send_to_session(
            &session,
            Channel::AudioOut,
            AudioOpcode::Init as u8,
            &body,
            Some(init_block),
        )
    }

    fn send_audio_buffer(
        &self,
        session: SessionHandle,
        stream_id: StreamId,
        buffer: &TransmittableAudioBuffer,
    ) -> Result<()> {
        let session = self.session(session)?;
        let body = AudioData {
            pts: buffer.pts,
            duration: buffer.duration,
            sequence: buffer.sequence,
            discontinuity: buffer.discontinuity,
            stream_id,
        };
        self.send_to_session(
            &session,
            Channel::AudioOut,
            AudioOpcode::Data as u8,
            &body,
            Some(&buffer.data),
        )
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
