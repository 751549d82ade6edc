//! Message envelope and stream framing
//!
//! Envelope layout: `[opcode][JSON body][0][payload]` where the terminator
//! and payload are present only for messages carrying binary data. JSON text
//! never contains a NUL byte, so the first zero after the opcode separates
//! body from payload unambiguously.
//!
//! Over TCP, each `[channel][envelope]` is prefixed with a variable-length
//! little-endian header: the low 2 bits of the first byte give the header
//! size minus one, the remaining bits the frame length. One byte covers
//! frames up to 63 bytes, four bytes up to 1 GB. Over UDP one datagram is
//! `[channel][envelope]` with no prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StreamError};
use crate::protocol::Channel;

/// Upper bound on a single frame (1 GB), limited by the 4-byte header
pub const MAX_FRAME_LENGTH: usize = 0x3FFF_FFFF;

/// A parsed message envelope
#[derive(Debug, Clone)]
pub struct Envelope {
    pub opcode: u8,
    pub body: Bytes,
    pub payload: Option<Bytes>,
}

impl Envelope {
    /// Deserialize the JSON body. Unknown fields are ignored.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| StreamError::InvalidMessage(format!("body parse failed: {}", e)))
    }
}

/// Serialize `body` into an envelope with the given opcode.
pub fn encode_message<T: Serialize>(opcode: u8, body: &T, payload: Option<&[u8]>) -> Result<Bytes> {
    let json = serde_json::to_vec(body)?;
    let payload_len = payload.map(|p| p.len() + 1).unwrap_or(0);
    let mut buf = BytesMut::with_capacity(1 + json.len() + payload_len);
    buf.put_u8(opcode);
    buf.extend_from_slice(&json);
    if let Some(payload) = payload {
        buf.put_u8(0);
        buf.extend_from_slice(payload);
    }
    Ok(buf.freeze())
}

/// Split a raw message into opcode, JSON body and optional payload.
pub fn decode_message(data: &[u8]) -> Result<Envelope> {
    if data.is_empty() {
        return Err(StreamError::InvalidMessage("empty message".to_string()));
    }
    let opcode = data[0];
    let rest = &data[1..];
    match rest.iter().position(|&b| b == 0) {
        Some(terminator) => Ok(Envelope {
            opcode,
            body: Bytes::copy_from_slice(&rest[..terminator]),
            payload: Some(Bytes::copy_from_slice(&rest[terminator + 1..])),
        }),
        None => Ok(Envelope {
            opcode,
            body: Bytes::copy_from_slice(rest),
            payload: None,
        }),
    }
}

/// Prefix `[channel][message]` with the variable-length header.
pub fn encode_stream_frame(channel: Channel, message: &[u8], buf: &mut BytesMut) -> Result<()> {
    let len = message.len() + 1;
    if len > MAX_FRAME_LENGTH {
        return Err(StreamError::InvalidArg("frame too large".to_string()));
    }
    buf.reserve(4 + len);
    if len <= 0x3F {
        buf.put_u8((len << 2) as u8);
    } else if len <= 0x3FFF {
        buf.put_u16_le(((len << 2) as u16) | 0x1);
    } else if len <= 0x3F_FFFF {
        let h = ((len << 2) as u32) | 0x2;
        buf.put_u16_le((h & 0xFFFF) as u16);
        buf.put_u8((h >> 16) as u8);
    } else {
        buf.put_u32_le(((len << 2) as u32) | 0x3);
    }
    buf.put_u8(channel as u8);
    buf.extend_from_slice(message);
    Ok(())
}

/// Build a standalone datagram for UDP transports.
pub fn encode_datagram(channel: Channel, message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + message.len());
    buf.put_u8(channel as u8);
    buf.extend_from_slice(message);
    buf.freeze()
}

/// Split a datagram into channel and message.
pub fn decode_datagram(data: &[u8]) -> Result<(Channel, &[u8])> {
    if data.is_empty() {
        return Err(StreamError::InvalidMessage("empty datagram".to_string()));
    }
    let channel = Channel::from_wire(data[0])
        .ok_or_else(|| StreamError::InvalidMessage(format!("unknown channel {}", data[0])))?;
    Ok((channel, &data[1..]))
}

/// Stateful decoder for the TCP byte stream
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending_len: Option<usize>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the next complete `[channel][message]` frame from `src`, or
    /// `None` when more bytes are needed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<(Channel, Bytes)>> {
        let frame_len = match self.pending_len {
            Some(len) => len,
            None => match self.decode_header(src)? {
                Some(len) => {
                    self.pending_len = Some(len);
                    len
                }
                None => return Ok(None),
            },
        };

        if src.len() < frame_len {
            return Ok(None);
        }
        self.pending_len = None;

        let frame = src.split_to(frame_len);
        let channel = Channel::from_wire(frame[0])
            .ok_or_else(|| StreamError::InvalidMessage(format!("unknown channel {}", frame[0])))?;
        Ok(Some((channel, frame.freeze().slice(1..))))
    }

    fn decode_header(&self, src: &mut BytesMut) -> Result<Option<usize>> {
        if src.is_empty() {
            return Ok(None);
        }
        let header_len = ((src[0] & 0x3) + 1) as usize;
        if src.len() < header_len {
            return Ok(None);
        }
        let mut n = src[0] as usize;
        if header_len > 1 {
            n |= (src[1] as usize) << 8;
        }
        if header_len > 2 {
            n |= (src[2] as usize) << 16;
        }
        if header_len > 3 {
            n |= (src[3] as usize) << 24;
        }
        n >>= 2;
        if n == 0 || n > MAX_FRAME_LENGTH {
            return Err(StreamError::InvalidMessage(format!(
                "bad frame length {}",
                n
            )));
        }
        src.advance(header_len);
        Ok(Some(n))
    }
}
