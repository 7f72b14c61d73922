//! Binary encodings for captured media.
//!
//! Video and audio frames cross two hops per frame (worker pipe, then the
//! peer transport) at up to the screen refresh rate, so they use a fixed
//! little-endian layout instead of JSON.
//!
//! Video frame body, 48-byte header:
//! ```text
//! [0..8]   capture_ts_us (i64)
//! [8..16]  start_encode_ts_us (i64)
//! [16..24] end_encode_ts_us (i64)
//! [24..28] width (u32)
//! [28..32] height (u32)
//! [32..40] picture_id (i64)
//! [40]     flags: bit 0 = keyframe
//! [41..44] reserved (must be 0)
//! [44..48] payload_length (u32)
//! [48..]   encoded frame
//! ```
//!
//! Audio frame body: raw encoded packet, no header.

use bytes::Bytes;

pub const VIDEO_FRAME_HEADER_SIZE: usize = 48;

const FLAG_KEYFRAME: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub capture_ts_us: i64,
    pub start_encode_ts_us: i64,
    pub end_encode_ts_us: i64,
    pub width: u32,
    pub height: u32,
    pub picture_id: i64,
    pub is_keyframe: bool,
    pub frame: Bytes,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("video frame body too short: {0} bytes (need at least {VIDEO_FRAME_HEADER_SIZE})")]
    TooShort(usize),
    #[error("video frame payload truncated: header says {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

impl VideoFrame {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VIDEO_FRAME_HEADER_SIZE + self.frame.len());
        buf.extend_from_slice(&self.capture_ts_us.to_le_bytes());
        buf.extend_from_slice(&self.start_encode_ts_us.to_le_bytes());
        buf.extend_from_slice(&self.end_encode_ts_us.to_le_bytes());
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.picture_id.to_le_bytes());
        buf.push(if self.is_keyframe { FLAG_KEYFRAME } else { 0 });
        buf.extend_from_slice(&[0u8; 3]); // reserved
        buf.extend_from_slice(&(self.frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.frame);
        buf
    }

    pub fn deserialize(body: &Bytes) -> Result<Self, MediaError> {
        if body.len() < VIDEO_FRAME_HEADER_SIZE {
            return Err(MediaError::TooShort(body.len()));
        }
        let b = &body[..];
        let payload_length =
            u32::from_le_bytes([b[44], b[45], b[46], b[47]]) as usize;
        if body.len() < VIDEO_FRAME_HEADER_SIZE + payload_length {
            return Err(MediaError::Truncated {
                expected: payload_length,
                actual: body.len() - VIDEO_FRAME_HEADER_SIZE,
            });
        }
        let i64_at = |o: usize| {
            i64::from_le_bytes([
                b[o],
                b[o + 1],
                b[o + 2],
                b[o + 3],
                b[o + 4],
                b[o + 5],
                b[o + 6],
                b[o + 7],
            ])
        };
        Ok(Self {
            capture_ts_us: i64_at(0),
            start_encode_ts_us: i64_at(8),
            end_encode_ts_us: i64_at(16),
            width: u32::from_le_bytes([b[24], b[25], b[26], b[27]]),
            height: u32::from_le_bytes([b[28], b[29], b[30], b[31]]),
            picture_id: i64_at(32),
            is_keyframe: b[40] & FLAG_KEYFRAME != 0,
            frame: body.slice(VIDEO_FRAME_HEADER_SIZE..VIDEO_FRAME_HEADER_SIZE + payload_length),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioData {
    pub data: Bytes,
}

impl AudioData {
    pub fn serialize(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn deserialize(body: &Bytes) -> Self {
        Self { data: body.clone() }
    }
}
