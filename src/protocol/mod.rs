//! Wire protocol
//!
//! Every message is `[1-byte opcode][JSON body][0 terminator when a binary
//! payload follows][payload]`, multiplexed over one UDP or TCP connection
//! per session on logical channels. JSON bodies ignore unknown fields so
//! either end can extend messages without breaking the other.

pub mod audio;
pub mod framing;
pub mod sensors;
pub mod service;
pub mod video;

use serde::{Deserialize, Serialize};

/// Logical channel a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    Service = 0,
    VideoOut = 1,
    VideoIn = 2,
    AudioOut = 3,
    AudioIn = 4,
    SensorsOut = 5,
    SensorsIn = 6,
    UserDefined = 7,
}

impl Channel {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Channel::Service),
            1 => Some(Channel::VideoOut),
            2 => Some(Channel::VideoIn),
            3 => Some(Channel::AudioOut),
            4 => Some(Channel::AudioIn),
            5 => Some(Channel::SensorsOut),
            6 => Some(Channel::SensorsIn),
            7 => Some(Channel::UserDefined),
            _ => None,
        }
    }
}

/// Media kind selector used by start/stop messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// Service channel opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceOpcode {
    Hello = 1,
    HelloResponse = 2,
    Connect = 3,
    ConnectResponse = 4,
    Start = 5,
    Stop = 6,
    Statistics = 7,
    Disconnect = 8,
    Update = 9,
}

impl ServiceOpcode {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(ServiceOpcode::Hello),
            2 => Some(ServiceOpcode::HelloResponse),
            3 => Some(ServiceOpcode::Connect),
            4 => Some(ServiceOpcode::ConnectResponse),
            5 => Some(ServiceOpcode::Start),
            6 => Some(ServiceOpcode::Stop),
            7 => Some(ServiceOpcode::Statistics),
            8 => Some(ServiceOpcode::Disconnect),
            9 => Some(ServiceOpcode::Update),
            _ => None,
        }
    }
}

/// Video channel opcodes (both directions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VideoOpcode {
    Init = 1,
    Data = 2,
    InitAck = 3,
    InitRequest = 4,
    ForceUpdate = 5,
    Cursor = 6,
}

impl VideoOpcode {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(VideoOpcode::Init),
            2 => Some(VideoOpcode::Data),
            3 => Some(VideoOpcode::InitAck),
            4 => Some(VideoOpcode::InitRequest),
            5 => Some(VideoOpcode::ForceUpdate),
            6 => Some(VideoOpcode::Cursor),
            _ => None,
        }
    }
}

/// Audio channel opcodes (both directions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AudioOpcode {
    Init = 1,
    Data = 2,
    InitAck = 3,
    InitRequest = 4,
}

impl AudioOpcode {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(AudioOpcode::Init),
            2 => Some(AudioOpcode::Data),
            3 => Some(AudioOpcode::InitAck),
            4 => Some(AudioOpcode::InitRequest),
            _ => None,
        }
    }
}

/// Sensors channel opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SensorsOpcode {
    OriginPts = 1,
}

impl SensorsOpcode {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(SensorsOpcode::OriginPts),
            _ => None,
        }
    }
}

/// Protocol revision advertised during discovery
pub const PROTOCOL_VERSION: u32 = 1;
