//! Client transport
//!
//! The receive side of the protocol, symmetric to the server transport.
//! It drives the integration tests and doubles as a reference for client
//! implementations: discovery, connect, subscribe, init acks, statistics
//! upload and frame receipt are all here.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::protocol::audio::{AudioData, AudioInit, AudioInitAck};
use crate::protocol::framing::{decode_message, encode_message, encode_stream_frame, StreamDecoder};
use crate::protocol::service::{
    Connect, ConnectResponse, Disconnect, Hello, HelloResponse, OriginPts, Start, Statistics, Stop,
    UpdateRequest, WireRole,
};
use crate::protocol::video::{CursorData, VideoData, VideoForceUpdate, VideoInit, VideoInitAck};
use crate::protocol::{
    AudioOpcode, Channel, MediaKind, SensorsOpcode, ServiceOpcode, VideoOpcode,
};
use crate::transport::cipher::{plaintext_signature_ok, AesPskCipher};
use crate::transport::{InitId, StreamId};
use crate::utils::queue::BoundedQueue;
use crate::utils::Pts;

/// Everything the server can push at a client
#[derive(Debug)]
pub enum ClientEvent {
    HelloResponse(HelloResponse),
    ConnectResponse(ConnectResponse),
    VideoInit {
        header: VideoInit,
        init_block: Bytes,
    },
    VideoFrame {
        header: VideoData,
        payload: Bytes,
    },
    Cursor {
        header: CursorData,
        bitmap: Bytes,
    },
    AudioInit {
        header: AudioInit,
        extradata: Bytes,
    },
    AudioBuffer {
        header: AudioData,
        payload: Bytes,
    },
    Disconnected,
}

pub struct ClientTransport {
    writer: Mutex<TcpStream>,
    cipher: Option<Arc<AesPskCipher>>,
    events: Arc<BoundedQueue<ClientEvent>>,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ClientTransport {
    pub fn connect(addr: SocketAddr, passphrase: Option<&str>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| StreamError::ConnectionRefused(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true).map_err(StreamError::Io)?;
        let read_stream = stream.try_clone().map_err(StreamError::Io)?;
        read_stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(StreamError::Io)?;

        let cipher = passphrase.map(|p| Arc::new(AesPskCipher::new(p)));
        let events = Arc::new(BoundedQueue::new(256));
        let stop = Arc::new(AtomicBool::new(false));

        let client = Self {
            writer: Mutex::new(stream),
            cipher: cipher.clone(),
            events: Arc::clone(&events),
            stop: Arc::clone(&stop),
            reader: Mutex::new(None),
        };

        let handle = std::thread::Builder::new()
            .name("client-receive".to_string())
            .spawn(move || receive_loop(read_stream, cipher, events, stop))
            .expect("failed to spawn client receive thread");
        *client.reader.lock() = Some(handle);
        Ok(client)
    }

    /// Next event pushed by the server, or `None` after `timeout`.
    pub fn recv_event(&self, timeout: Duration) -> Option<ClientEvent> {
        self.events.pop(timeout)
    }

    /// Wait for an event matching `filter`, discarding others.
    pub fn wait_for<T>(
        &self,
        timeout: Duration,
        mut filter: impl FnMut(ClientEvent) -> Option<T>,
    ) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            let event = self.events.pop(remaining)?;
            if let Some(value) = filter(event) {
                return Some(value);
            }
        }
    }

    fn send<T: Serialize>(
        &self,
        channel: Channel,
        opcode: u8,
        body: &T,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        let message = encode_message(opcode, body, payload)?;
        let wire = match &self.cipher {
            Some(cipher) => cipher.encrypt(&message)?,
            None => message.to_vec(),
        };
        let mut buf = BytesMut::new();
        encode_stream_frame(channel, &wire, &mut buf)?;
        let mut writer = self.writer.lock();
        writer.write_all(&buf).map_err(StreamError::Io)?;
        writer.flush().map_err(StreamError::Io)
    }

    pub fn hello(&self, client_id: &str) -> Result<()> {
        self.send(
            Channel::Service,
            ServiceOpcode::Hello as u8,
            &Hello {
                client_id: client_id.to_string(),
                ..Default::default()
            },
            None,
        )
    }

    pub fn connect_session(&self, role: WireRole) -> Result<()> {
        self.send(
            Channel::Service,
            ServiceOpcode::Connect as u8,
            &Connect {
                client_id: String::new(),
                role,
            },
            None,
        )
    }

    pub fn start(&self, kind: MediaKind, stream_id: StreamId) -> Result<()> {
        self.send(
            Channel::Service,
            ServiceOpcode::Start as u8,
            &Start {
                kind,
                stream_id,
                ..Default::default()
            },
            None,
        )
    }

    pub fn stop(&self, kind: Option<MediaKind>, stream_id: StreamId) -> Result<()> {
        self.send(
            Channel::Service,
            ServiceOpcode::Stop as u8,
            &Stop { kind, stream_id },
            None,
        )
    }

    pub fn video_init_ack(&self, init_id: InitId, stream_id: StreamId) -> Result<()> {
        self.send(
            Channel::VideoIn,
            VideoOpcode::InitAck as u8,
            &VideoInitAck { init_id, stream_id },
            None,
        )
    }

    pub fn audio_init_ack(&self, init_id: InitId, stream_id: StreamId) -> Result<()> {
        self.send(
            Channel::AudioIn,
            AudioOpcode::InitAck as u8,
            &AudioInitAck { init_id, stream_id },
            None,
        )
    }

    pub fn request_force_update(&self, stream_id: StreamId) -> Result<()> {
        self.send(
            Channel::VideoIn,
            VideoOpcode::ForceUpdate as u8,
            &VideoForceUpdate { stream_id },
            None,
        )
    }

    pub fn send_statistics(&self, stats: &Statistics) -> Result<()> {
        self.send(Channel::Service, ServiceOpcode::Statistics as u8, stats, None)
    }

    pub fn request_stream_update(&self, update: &UpdateRequest) -> Result<()> {
        self.send(Channel::Service, ServiceOpcode::Update as u8, update, None)
    }

    pub fn send_origin_pts(&self, origin_pts: Pts) -> Result<()> {
        self.send(
            Channel::SensorsIn,
            SensorsOpcode::OriginPts as u8,
            &OriginPts { origin_pts },
            None,
        )
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(
            Channel::Service,
            ServiceOpcode::Disconnect as u8,
            &Disconnect {},
            None,
        )
    }

    pub fn close(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.writer.lock().shutdown(std::net::Shutdown::Both);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(
    mut stream: TcpStream,
    cipher: Option<Arc<AesPskCipher>>,
    events: Arc<BoundedQueue<ClientEvent>>,
    stop: Arc<AtomicBool>,
) {
    let mut decoder = StreamDecoder::new();
    let mut pending = BytesMut::with_capacity(64 * 1024);
    let mut read_buf = [0u8; 64 * 1024];

    while !stop.load(Ordering::Relaxed) {
        match stream.read(&mut read_buf) {
            Ok(0) => {
                let _ = events.push(ClientEvent::Disconnected, Duration::from_millis(100));
                return;
            }
            Ok(n) => {
                pending.extend_from_slice(&read_buf[..n]);
                loop {
                    match decoder.decode(&mut pending) {
                        Ok(Some((channel, message))) => {
                            if let Some(event) = parse_event(&cipher, channel, &message) {
                                // A slow consumer drops the oldest data
                                // rather than stalling the socket
                                if events.push(event, Duration::from_millis(500)).is_err() {
                                    warn!("client event queue saturated, event dropped");
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "client stream framing error");
                            let _ =
                                events.push(ClientEvent::Disconnected, Duration::from_millis(100));
                            return;
                        }
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => {
                if !stop.load(Ordering::Relaxed) {
                    let _ = events.push(ClientEvent::Disconnected, Duration::from_millis(100));
                }
                return;
            }
        }
    }
}

fn parse_event(
    cipher: &Option<Arc<AesPskCipher>>,
    channel: Channel,
    message: &[u8],
) -> Option<ClientEvent> {
    let decrypted;
    let plaintext: &[u8] = match cipher {
        Some(cipher) => match cipher.decrypt(message) {
            Ok(clear) => {
                decrypted = clear;
                &decrypted
            }
            Err(e) => {
                warn!(error = %e, "client message decryption failed, dropped");
                return None;
            }
        },
        None => message,
    };
    if !plaintext_signature_ok(plaintext) {
        warn!("client passphrase signature check failed, message dropped");
        return None;
    }

    let envelope = match decode_message(plaintext) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "client received malformed message");
            return None;
        }
    };
    let payload = envelope.payload.clone().unwrap_or_default();

    let event = match channel {
        Channel::Service => match ServiceOpcode::from_wire(envelope.opcode)? {
            ServiceOpcode::HelloResponse => {
                ClientEvent::HelloResponse(envelope.parse_body().ok()?)
            }
            ServiceOpcode::ConnectResponse => {
                ClientEvent::ConnectResponse(envelope.parse_body().ok()?)
            }
            other => {
                debug!(?other, "unexpected service opcode at client");
                return None;
            }
        },
        Channel::VideoOut => match VideoOpcode::from_wire(envelope.opcode)? {
            VideoOpcode::Init => ClientEvent::VideoInit {
                header: envelope.parse_body().ok()?,
                init_block: payload,
            },
            VideoOpcode::Data => ClientEvent::VideoFrame {
                header: envelope.parse_body().ok()?,
                payload,
            },
            VideoOpcode::Cursor => ClientEvent::Cursor {
                header: envelope.parse_body().ok()?,
                bitmap: payload,
            },
            other => {
                debug!(?other, "unexpected video opcode at client");
                return None;
            }
        },
        Channel::AudioOut => match AudioOpcode::from_wire(envelope.opcode)? {
            AudioOpcode::Init => ClientEvent::AudioInit {
                header: envelope.parse_body().ok()?,
                extradata: payload,
            },
            AudioOpcode::Data => ClientEvent::AudioBuffer {
                header: envelope.parse_body().ok()?,
                payload,
            },
            other => {
                debug!(?other, "unexpected audio opcode at client");
                return None;
            }
        },
        other => {
            debug!(?other, "unexpected channel at client");
            return None;
        }
    };
    Some(event)
}
