//! Audio channel messages

use serde::{Deserialize, Serialize};

use crate::transport::{InitId, StreamId, DEFAULT_STREAM};
use crate::utils::Pts;

fn is_default_stream(id: &StreamId) -> bool {
    *id == DEFAULT_STREAM
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// `AudioInit`: codec parameters, with extradata (if any) in the payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioInit {
    pub codec: String,
    pub init_id: InitId,
    #[serde(skip_serializing_if = "is_default_stream")]
    pub stream_id: StreamId,
    pub channels: u32,
    pub layout: u32,
    /// `SampleFormat` on the wire
    pub format: u32,
    pub sampling_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioInitAck {
    pub init_id: InitId,
    #[serde(skip_serializing_if = "is_default_stream")]
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioInitRequest {
    #[serde(skip_serializing_if = "is_default_stream")]
    pub stream_id: StreamId,
}

/// `AudioData`: one compressed (or PCM) buffer, data in the payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioData {
    pub pts: Pts,
    pub duration: Pts,
    pub sequence: u64,
    #[serde(skip_serializing_if = "is_false")]
    pub discontinuity: bool,
    #[serde(skip_serializing_if = "is_default_stream")]
    pub stream_id: StreamId,
}
