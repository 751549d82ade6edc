//! Video channel messages

use serde::{Deserialize, Serialize};

use crate::transport::{InitId, StreamId, DEFAULT_STREAM};
use crate::utils::Pts;
use crate::video::format::Rect;

fn is_default_stream(id: &StreamId) -> bool {
    *id == DEFAULT_STREAM
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// `VideoInit`: codec init block announcement. The init-block bytes ride in
/// the binary payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoInit {
    pub codec: String,
    pub init_id: InitId,
    #[serde(skip_serializing_if = "is_default_stream")]
    pub stream_id: StreamId,
    pub width: u32,
    pub height: u32,
    pub viewport: Rect,
    pub bit_depth: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub stereoscopic: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub foveated: bool,
}

/// `VideoInitAck`; a negative `init_id` is a NACK
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoInitAck {
    pub init_id: InitId,
    #[serde(skip_serializing_if = "is_default_stream")]
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoInitRequest {
    #[serde(skip_serializing_if = "is_default_stream")]
    pub stream_id: StreamId,
}

/// `VideoData`: one compressed subframe, frame bytes in the payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoData {
    pub pts: Pts,
    pub origin_pts: Pts,
    pub server_latency: Pts,
    pub encoder_latency: Pts,
    pub frame_size: u32,
    /// `ViewType` on the wire
    pub view_type: u32,
    /// `SubframeType` on the wire
    pub frame_type: u32,
    pub send_duration: Pts,
    pub frame_num: u64,
    pub duration: Pts,
    #[serde(skip_serializing_if = "is_false")]
    pub discontinuity: bool,
    #[serde(skip_serializing_if = "is_default_stream")]
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoForceUpdate {
    #[serde(skip_serializing_if = "is_default_stream")]
    pub stream_id: StreamId,
}

/// Cursor shape/position update; bitmap rides in the payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CursorData {
    pub width: u32,
    pub height: u32,
    pub hotspot_x: i32,
    pub hotspot_y: i32,
    pub capture_width: u32,
    pub capture_height: u32,
    /// 0 = color, 1 = monochrome
    pub kind: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub visible: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::{decode_message, encode_message};
    use crate::protocol::VideoOpcode;
    use crate::video::frame::{SubframeType, ViewType};

    #[test]
    fn test_video_init_round_trip_with_payload() {
        let init = VideoInit {
            codec: "h264".to_string(),
            init_id: 123_456,
            stream_id: DEFAULT_STREAM,
            width: 1920,
            height: 1080,
            viewport: Rect::new(0, 0, 1920, 1080),
            bit_depth: 8,
            stereoscopic: false,
            foveated: false,
        };
        let sps_pps = vec![0u8, 0, 0, 1, 0x67, 0x42];
        let raw = encode_message(VideoOpcode::Init as u8, &init, Some(&sps_pps)).unwrap();
        let env = decode_message(&raw).unwrap();
        assert_eq!(env.opcode, VideoOpcode::Init as u8);
        assert_eq!(env.parse_body::<VideoInit>().unwrap(), init);
        assert_eq!(env.payload.as_deref(), Some(sps_pps.as_slice()));
    }

    #[test]
    fn test_video_data_round_trip() {
        let data = VideoData {
            pts: 1_000_000,
            origin_pts: 900_000,
            server_latency: 40_000,
            encoder_latency: 30_000,
            frame_size: 4096,
            view_type: ViewType::Monoscopic.to_wire(),
            frame_type: SubframeType::Idr.to_wire(),
            send_duration: 1_500,
            frame_num: 17,
            duration: 166_667,
            discontinuity: true,
            stream_id: DEFAULT_STREAM,
        };
        let frame_bytes = vec![0xAB; 4096];
        let raw = encode_message(VideoOpcode::Data as u8, &data, Some(&frame_bytes)).unwrap();
        let env = decode_message(&raw).unwrap();
        assert_eq!(env.parse_body::<VideoData>().unwrap(), data);
        assert_eq!(env.payload.map(|p| p.len()), Some(4096));
    }

    #[test]
    fn test_nack_is_negative_init_id() {
        let ack = VideoInitAck {
            init_id: -1,
            stream_id: DEFAULT_STREAM,
        };
        let raw = encode_message(VideoOpcode::InitAck as u8, &ack, None).unwrap();
        let parsed: VideoInitAck = decode_message(&raw).unwrap().parse_body().unwrap();
        assert!(parsed.init_id < 0);
    }
}
