//! Receive-side video frame assembly
//!
//! Reassembles sliced frames and watches the per-stream frame numbering for
//! gaps. A gap, or a non-key first frame, means the decoder cannot proceed;
//! the assembler asks for a key frame upstream, rate-limited so a burst of
//! losses does not turn into a burst of requests.

use bytes::{Bytes, BytesMut};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::protocol::video::VideoData;
use crate::utils::Pts;
use crate::video::frame::SubframeType;

/// Minimum spacing between force-update requests
const FORCE_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// A fully reassembled frame ready for the decoder
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub pts: Pts,
    pub origin_pts: Pts,
    pub frame_num: u64,
    pub subframe_type: SubframeType,
    pub data: Bytes,
}

/// Outcome of submitting one received subframe
#[derive(Debug, Default)]
pub struct SubmitOutcome {
    pub delivered: Option<AssembledFrame>,
    /// Caller should send a force-update request upstream
    pub request_key_frame: bool,
}

pub struct VideoStreamAssembler {
    last_frame_num: Option<u64>,
    waiting_for_key_frame: bool,
    last_force_update: Option<Instant>,
    slices: BytesMut,
    slice_pts: Pts,
    have_slices: bool,
}

impl VideoStreamAssembler {
    pub fn new() -> Self {
        Self {
            last_frame_num: None,
            waiting_for_key_frame: true,
            last_force_update: None,
            slices: BytesMut::new(),
            slice_pts: 0,
            have_slices: false,
        }
    }

    /// Forget stream position, e.g. after a decoder reinit.
    pub fn reset(&mut self) {
        self.last_frame_num = None;
        self.waiting_for_key_frame = true;
        self.slices.clear();
        self.have_slices = false;
    }

    fn rate_limited_request(&mut self) -> bool {
        let now = Instant::now();
        match self.last_force_update {
            Some(at) if now.duration_since(at) < FORCE_UPDATE_INTERVAL => false,
            _ => {
                self.last_force_update = Some(now);
                true
            }
        }
    }

    /// Submit one received subframe with its payload.
    pub fn submit(&mut self, header: &VideoData, payload: Bytes) -> SubmitOutcome {
        let mut outcome = SubmitOutcome::default();
        let subframe_type = SubframeType::from_wire(header.frame_type).unwrap_or(SubframeType::Unknown);

        // A slice accumulating under one pts is closed by a non-slice
        // subframe with the same pts; a different pts means the frame was
        // torn and must be dropped
        if self.have_slices && header.pts != self.slice_pts {
            warn!(
                expected = self.slice_pts,
                received = header.pts,
                "slice belongs to a different frame, accumulator dropped"
            );
            self.slices.clear();
            self.have_slices = false;
            outcome.request_key_frame = self.rate_limited_request();
            return outcome;
        }

        if subframe_type == SubframeType::Slice {
            if !self.have_slices {
                self.slice_pts = header.pts;
                self.have_slices = true;
            }
            self.slices.extend_from_slice(&payload);
            return outcome;
        }

        // Frame-number continuity checks apply at frame granularity, on the
        // closing subframe
        if self.waiting_for_key_frame && !subframe_type.is_key() {
            warn!(
                frame_num = header.frame_num,
                "first frame after init must be a key frame, ignored"
            );
            self.slices.clear();
            self.have_slices = false;
            outcome.request_key_frame = self.rate_limited_request();
            return outcome;
        }

        if subframe_type.is_key() {
            self.waiting_for_key_frame = false;
        } else if let Some(last) = self.last_frame_num {
            if last + 1 != header.frame_num {
                warn!(
                    expected = last + 1,
                    received = header.frame_num,
                    "video frame lost"
                );
                self.slices.clear();
                self.have_slices = false;
                outcome.request_key_frame = self.rate_limited_request();
                return outcome;
            }
        }
        self.last_frame_num = Some(header.frame_num);

        let data = if self.have_slices {
            self.slices.extend_from_slice(&payload);
            self.have_slices = false;
            self.slices.split().freeze()
        } else {
            payload
        };

        outcome.delivered = Some(AssembledFrame {
            pts: header.pts,
            origin_pts: header.origin_pts,
            frame_num: header.frame_num,
            subframe_type,
            data,
        });
        outcome
    }
}

impl Default for VideoStreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}
