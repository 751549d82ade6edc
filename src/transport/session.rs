//! Per-session state
//!
//! A session is the server-side record of one connected peer: its link,
//! role, lifecycle state and the counters the transport measures on its
//! behalf (sequence numbers, send durations, force-IDR requests). Send
//! counters live under a per-session mutex so concurrent streaming sessions
//! do not contend on one global lock.

use parking_lot::Mutex;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Result, StreamError};
use crate::protocol::framing::{encode_datagram, encode_stream_frame};
use crate::protocol::Channel;
use crate::transport::cipher::AesPskCipher;
use crate::transport::{ClientRole, SessionHandle};
use crate::utils::clock::{now_pts, Pts};

/// Lifecycle of one session; variants are ordered by progress through the
/// handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Link exists, nothing negotiated yet
    New,
    /// Hello exchanged
    Discovered,
    /// Connect accepted
    Connected,
    /// At least one Start received
    Subscribed,
    /// Torn down
    Terminated,
}

/// How bytes reach the peer
pub enum SessionLink {
    Tcp(Mutex<TcpStream>),
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

#[derive(Default)]
pub struct SendCounters {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    /// Duration of the most recent send, milliseconds
    pub last_send_time: f32,
    /// Worst send duration since last stats forward, milliseconds
    pub worst_send_time: f32,
}

pub struct Session {
    pub handle: SessionHandle,
    pub peer: SocketAddr,
    pub created_at: Pts,
    link: SessionLink,
    cipher: Option<Arc<AesPskCipher>>,
    state: Mutex<SessionState>,
    role: Mutex<ClientRole>,
    /// Controller whose pose/origin submissions are ignored
    demoted: AtomicBool,
    last_seen: AtomicI64,
    force_idr_requests: AtomicI64,
    pub subscribed_video: AtomicBool,
    pub subscribed_audio: AtomicBool,
    counters: Mutex<SendCounters>,
}

impl Session {
    pub fn new(
        handle: SessionHandle,
        peer: SocketAddr,
        link: SessionLink,
        cipher: Option<Arc<AesPskCipher>>,
    ) -> Arc<Self> {
        let now = now_pts();
        Arc::new(Self {
            handle,
            peer,
            created_at: now,
            link,
            cipher,
            state: Mutex::new(SessionState::New),
            role: Mutex::new(ClientRole::Viewer),
            demoted: AtomicBool::new(false),
            last_seen: AtomicI64::new(now),
            force_idr_requests: AtomicI64::new(0),
            subscribed_video: AtomicBool::new(false),
            subscribed_audio: AtomicBool::new(false),
            counters: Mutex::new(SendCounters::default()),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn role(&self) -> ClientRole {
        *self.role.lock()
    }

    pub fn set_role(&self, role: ClientRole) {
        *self.role.lock() = role;
    }

    pub fn is_demoted(&self) -> bool {
        self.demoted.load(Ordering::Relaxed)
    }

    pub fn set_demoted(&self, demoted: bool) {
        self.demoted.store(demoted, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_seen.store(now_pts(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> Pts {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn count_force_idr_request(&self) -> i64 {
        self.force_idr_requests.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn force_idr_request_count(&self) -> i64 {
        self.force_idr_requests.load(Ordering::Relaxed)
    }

    /// Worst send duration observed since the last call, milliseconds.
    pub fn take_worst_send_time(&self) -> f32 {
        let mut counters = self.counters.lock();
        let worst = counters.worst_send_time;
        counters.worst_send_time = 0.0;
        worst
    }

    pub fn last_send_time(&self) -> f32 {
        self.counters.lock().last_send_time
    }

    /// Encrypt (when configured), frame and send one message. The send is
    /// timed; spikes feed the QoS worst-send-time signal.
    pub fn send_message(&self, channel: Channel, message: &[u8]) -> Result<()> {
        let wire: Vec<u8> = match &self.cipher {
            Some(cipher) => cipher.encrypt(message)?,
            None => message.to_vec(),
        };

        let started = Instant::now();
        let sent_bytes = match &self.link {
            SessionLink::Tcp(stream) => {
                let mut buf = bytes::BytesMut::new();
                encode_stream_frame(channel, &wire, &mut buf)?;
                let mut stream = stream.lock();
                stream.write_all(&buf).map_err(StreamError::Io)?;
                stream.flush().map_err(StreamError::Io)?;
                buf.len()
            }
            SessionLink::Udp { socket, peer } => {
                let datagram = encode_datagram(channel, &wire);
                socket.send_to(&datagram, peer).map_err(StreamError::Io)?;
                datagram.len()
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f32() * 1000.0;
        let mut counters = self.counters.lock();
        counters.messages_sent += 1;
        counters.bytes_sent += sent_bytes as u64;
        counters.last_send_time = elapsed_ms;
        if elapsed_ms > counters.worst_send_time {
            counters.worst_send_time = elapsed_ms;
        }
        Ok(())
    }

    pub fn shutdown_link(&self) {
        if let SessionLink::Tcp(stream) = &self.link {
            let _ = stream.lock().shutdown(std::net::Shutdown::Both);
        }
    }
}
