//! Peer transport beneath the worker session.
//!
//! Two variants share one event stream: `Tcp` (ordered/reliable, single
//! accepted peer, framed with the wire codec) and `Rtc` (ICE/DTLS/SRTP via
//! webrtc-rs, unreliable media + reliable control). The variant that lacks a
//! capability simply never emits the corresponding event; TCP has no
//! bandwidth estimator, so `VideoBitrateUpdate` cannot fire there.

pub mod rtc;
pub mod tcp;

use anyhow::Result;
use bytes::Bytes;
use lanthing_proto::media::{AudioData, VideoFrame};
use lanthing_proto::messages::{Message, StreamingParams, TransportType};
use tokio::sync::mpsc;

/// Uniform callbacks, delivered as a stream to the owning session.
#[derive(Debug)]
pub enum TransportEvent {
    /// The single remote client finished the transport handshake.
    Accepted,
    /// Terminal: the connection is gone. Emitted exactly once; nothing
    /// follows it.
    Disconnected,
    /// Terminal failure before or during the connection.
    Failed,
    /// Outgoing signaling payload to relay to the peer.
    SignalingMessage { key: String, value: String },
    /// Incoming control payload from the peer.
    Data {
        msg_type: u32,
        body: Bytes,
        reliable: bool,
    },
    /// Peer requested an IDR (RTC out-of-band path).
    KeyframeRequest,
    /// Bandwidth estimate update, bits per second (RTC only).
    VideoBitrateUpdate(u32),
    /// Fraction of video packets lost over the last interval (RTC only).
    LossRateUpdate(f32),
}

/// Everything a variant needs to come up.
pub struct TransportParams {
    pub streaming: StreamingParams,
    pub min_port: u16,
    pub max_port: u16,
    /// Use the embedded NAT traversal helper (reflex/relay lists + p2p
    /// credentials) instead of default STUN.
    pub use_nbp2p: bool,
    pub p2p_username: String,
    pub p2p_password: String,
    pub reflex_servers: Vec<String>,
    pub relay_servers: Vec<String>,
    /// Network interface to keep out of ICE gathering ("" = none).
    pub ignored_nic: String,
    pub event_tx: mpsc::Sender<TransportEvent>,
}

pub enum Transport {
    Tcp(tcp::TcpTransport),
    Rtc(rtc::RtcTransport),
}

impl Transport {
    /// Build the variant the admission decision picked. `ForceRtc`
    /// normalizes to `Rtc`.
    pub async fn create(transport_type: TransportType, params: TransportParams) -> Result<Self> {
        match transport_type {
            TransportType::Tcp => Ok(Transport::Tcp(tcp::TcpTransport::bind(params).await?)),
            TransportType::Rtc | TransportType::ForceRtc => {
                Ok(Transport::Rtc(rtc::RtcTransport::new(params).await?))
            }
        }
    }

    pub fn kind(&self) -> TransportType {
        match self {
            Transport::Tcp(_) => TransportType::Tcp,
            Transport::Rtc(_) => TransportType::Rtc,
        }
    }

    /// Unreliable-capable video path (ordered within the stream).
    pub fn send_video(&self, frame: VideoFrame) -> bool {
        match self {
            Transport::Tcp(t) => t.send_message(&Message::VideoFrame(frame), true),
            Transport::Rtc(t) => t.send_video(frame),
        }
    }

    pub fn send_audio(&self, audio: AudioData) -> bool {
        match self {
            Transport::Tcp(t) => t.send_message(&Message::AudioData(audio), true),
            Transport::Rtc(t) => t.send_audio(audio),
        }
    }

    /// Control-channel message. On TCP every send is effectively reliable.
    pub fn send_message(&self, msg: &Message, reliable: bool) -> bool {
        match self {
            Transport::Tcp(t) => t.send_message(msg, true),
            Transport::Rtc(t) => t.send_message(msg, reliable),
        }
    }

    /// Incoming signaling payload from the peer.
    pub fn on_signaling_message(&self, key: &str, value: &str) {
        match self {
            Transport::Tcp(t) => t.on_signaling_message(key, value),
            Transport::Rtc(t) => t.on_signaling_message(key, value),
        }
    }

    /// `(bwe_bps, nack_count)` snapshot for the periodic send-side report.
    pub fn stats(&self) -> (u32, u32) {
        match self {
            Transport::Tcp(_) => (tcp::TCP_BWE_BPS, 0),
            Transport::Rtc(t) => t.stats(),
        }
    }

    /// Idempotent, asynchronous. The owner keeps the transport alive until
    /// `Disconnected` arrives.
    pub fn close(&self) {
        match self {
            Transport::Tcp(t) => t.close(),
            Transport::Rtc(t) => t.close(),
        }
    }
}

/// Data-channel payload layout shared by both variants: 4-byte LE type tag
/// followed by the message body (the stream codec's frame header is not
/// needed where the channel already preserves message boundaries).
pub fn encode_channel_payload(msg: &Message) -> Result<Vec<u8>> {
    let packet = msg.to_packet()?;
    let mut payload = Vec::with_capacity(4 + packet.body.len());
    payload.extend_from_slice(&packet.msg_type.to_le_bytes());
    payload.extend_from_slice(&packet.body);
    Ok(payload)
}

/// Split a channel payload back into `(msg_type, body)`.
pub fn decode_channel_payload(payload: &[u8]) -> Option<(u32, Bytes)> {
    if payload.len() < 4 {
        return None;
    }
    let msg_type = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Some((msg_type, Bytes::copy_from_slice(&payload[4..])))
}
