//! Service channel messages: discovery, connection, stream lifecycle and
//! statistics.

use serde::{Deserialize, Serialize};

use crate::protocol::MediaKind;
use crate::transport::StreamId;
use crate::utils::Pts;

/// `Hello`: first message from a client, opens discovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Hello {
    pub client_id: String,
    pub protocol_version: u32,
}

impl Default for Hello {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            protocol_version: crate::protocol::PROTOCOL_VERSION,
        }
    }
}

/// Server reply to `Hello`: capabilities and default stream parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloResponse {
    pub protocol_version: u32,
    pub port: u16,
    pub accepted: bool,
    pub video_codecs: Vec<String>,
    pub audio_codecs: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub bitrate: i64,
    pub framerate: f32,
    pub audio_channels: u32,
    pub audio_layout: u32,
    pub sampling_rate: u32,
    pub cipher: bool,
}

/// Role requested in a `Connect`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    #[default]
    Viewer,
    Controller,
}

/// `Connect`: upgrade a discovered peer to a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Connect {
    pub client_id: String,
    pub role: WireRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `Start`: subscribe to one media stream. The server treats the bitrate
/// and framerate fields as hints and may ignore them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Start {
    pub kind: MediaKind,
    pub stream_id: StreamId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framerate: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
}

impl Default for Start {
    fn default() -> Self {
        Self {
            kind: MediaKind::Video,
            stream_id: crate::transport::DEFAULT_STREAM,
            bitrate: None,
            framerate: None,
            display_width: None,
            display_height: None,
            codec: None,
        }
    }
}

/// `Stop`: unsubscribe one media kind, or all when `kind` is omitted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Stop {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub stream_id: StreamId,
}

/// Periodic receiver-side statistics (all latencies in milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Statistics {
    pub stream_id: StreamId,
    pub full: f32,
    pub client: f32,
    pub server: f32,
    pub encoder: f32,
    pub network: f32,
    pub decoder: f32,
    pub decoder_queue: i64,
    pub framerate: f32,
}

/// `Disconnect`: graceful session close
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Disconnect {}

/// Receiver-requested stream parameter change; absent fields stay as-is
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateRequest {
    pub stream_id: StreamId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framerate: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Latency probe from the controller client (sensors channel)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OriginPts {
    pub origin_pts: Pts,
}
