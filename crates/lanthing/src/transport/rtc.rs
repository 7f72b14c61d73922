//! RTC transport variant.
//!
//! A webrtc-rs peer connection on the host side: the remote client sends the
//! SDP offer through signaling, we answer. Media goes out as RTP samples on
//! H.264/H.265 + Opus tracks; control rides data channels opened by the
//! client (`control` reliable/ordered, `bulk` lossy). PLI/FIR and REMB from
//! the peer surface as keyframe requests and bandwidth updates; a 1 s stats
//! loop derives the interval loss rate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use lanthing_proto::media::{AudioData, VideoFrame};
use lanthing_proto::messages::{Message, VideoCodecType};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{TransportEvent, TransportParams, decode_channel_payload, encode_channel_payload};

pub const SIG_KEY_OFFER: &str = "offer";
pub const SIG_KEY_ANSWER: &str = "answer";
pub const SIG_KEY_CANDIDATE: &str = "candidate";

const CONTROL_CHANNEL: &str = "control";
const BULK_CHANNEL: &str = "bulk";

const MIME_TYPE_H264: &str = "video/H264";
const MIME_TYPE_H265: &str = "video/H265";

#[derive(Serialize, Deserialize)]
struct IceCandidateJson {
    candidate: String,
    sdp_mid: Option<String>,
    sdp_mline_index: Option<u16>,
}

type SharedDc = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

enum WriterCmd {
    Video(VideoFrame),
    Audio(AudioData),
    Data { payload: Vec<u8>, reliable: bool },
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    writer_tx: mpsc::Sender<WriterCmd>,
    event_tx: mpsc::Sender<TransportEvent>,
    bwe_bps: Arc<AtomicU32>,
    nack: Arc<AtomicU32>,
    closing: Arc<AtomicBool>,
    disconnect_emitted: Arc<AtomicBool>,
}

fn video_capability(codec: VideoCodecType) -> RTCRtpCodecCapability {
    let feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "ccm".into(),
            parameter: "fir".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "".into(),
        },
        RTCPFeedback {
            typ: "nack".into(),
            parameter: "pli".into(),
        },
        RTCPFeedback {
            typ: "transport-cc".into(),
            parameter: "".into(),
        },
    ];
    match codec {
        VideoCodecType::H264_420 | VideoCodecType::H264_444 => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line:
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                    .to_string(),
            rtcp_feedback: feedback,
        },
        VideoCodecType::H265_420 | VideoCodecType::H265_444 => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H265.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: feedback,
        },
    }
}

/// Map reflex/relay lists to ICE server entries. Entries without a scheme
/// get the appropriate one; relay entries carry the p2p credentials.
fn build_ice_servers(params: &TransportParams) -> Vec<RTCIceServer> {
    if !params.use_nbp2p
        || (params.reflex_servers.is_empty() && params.relay_servers.is_empty())
    {
        return vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        }];
    }

    let mut servers = Vec::new();
    let reflex: Vec<String> = params
        .reflex_servers
        .iter()
        .map(|s| ensure_scheme(s, "stun"))
        .collect();
    if !reflex.is_empty() {
        servers.push(RTCIceServer {
            urls: reflex,
            ..Default::default()
        });
    }
    let relay: Vec<String> = params
        .relay_servers
        .iter()
        .map(|s| ensure_scheme(s, "turn"))
        .collect();
    if !relay.is_empty() {
        servers.push(RTCIceServer {
            urls: relay,
            username: params.p2p_username.clone(),
            credential: params.p2p_password.clone(),
        });
    }
    servers
}

fn ensure_scheme(url: &str, scheme: &str) -> String {
    for known in ["stun:", "stuns:", "turn:", "turns:"] {
        if url.starts_with(known) {
            return url.to_string();
        }
    }
    format!("{scheme}:{url}")
}

impl RtcTransport {
    pub async fn new(params: TransportParams) -> Result<RtcTransport> {
        let video_codec = params
            .streaming
            .video_codecs
            .first()
            .copied()
            .context("No negotiated video codec")?;

        let mut media_engine = MediaEngine::default();
        // Register only the negotiated codec + Opus. Default codec sets
        // invite the client to negotiate something the encoder won't emit.
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: video_capability(video_codec),
                payload_type: 125,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: params.streaming.audio_sample_rate.max(8000),
                    channels: params.streaming.audio_channels.min(u16::MAX as u32) as u16,
                    sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let mut setting_engine = SettingEngine::default();
        if !params.ignored_nic.is_empty() {
            let ignored = params.ignored_nic.clone();
            setting_engine
                .set_interface_filter(Some(Arc::new(move |ifc: &str| ifc != ignored)));
        }
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let config = RTCConfiguration {
            ice_servers: build_ice_servers(&params),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            video_capability(video_codec),
            "video".to_string(),
            "lanthing".to_string(),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: params.streaming.audio_sample_rate.max(8000),
                channels: params.streaming.audio_channels.min(u16::MAX as u32) as u16,
                ..Default::default()
            },
            "audio".to_string(),
            "lanthing".to_string(),
        ));

        let video_sender = pc
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;
        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add audio track")?;

        let event_tx = params.event_tx.clone();
        let bwe_bps = Arc::new(AtomicU32::new(0));
        let nack = Arc::new(AtomicU32::new(0));
        let closing = Arc::new(AtomicBool::new(false));
        let disconnect_emitted = Arc::new(AtomicBool::new(false));
        let control_dc: SharedDc = Arc::new(Mutex::new(None));
        let bulk_dc: SharedDc = Arc::new(Mutex::new(None));

        // Connection state -> uniform events.
        {
            let tx = event_tx.clone();
            let closing = Arc::clone(&closing);
            let disconnect_emitted = Arc::clone(&disconnect_emitted);
            let accepted = AtomicBool::new(false);
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let tx = tx.clone();
                let emit_accept = state == RTCPeerConnectionState::Connected
                    && !accepted.swap(true, Ordering::SeqCst);
                let emit_failed = state == RTCPeerConnectionState::Failed
                    && !closing.load(Ordering::SeqCst)
                    && !disconnect_emitted.load(Ordering::SeqCst);
                let emit_disconnect = state == RTCPeerConnectionState::Closed
                    && !disconnect_emitted.swap(true, Ordering::SeqCst);
                match state {
                    RTCPeerConnectionState::Disconnected => {
                        warn!("Peer connection disconnected (ICE reconnecting)");
                    }
                    _ => info!(?state, "Peer connection state changed"),
                }
                Box::pin(async move {
                    if emit_accept {
                        let _ = tx.send(TransportEvent::Accepted).await;
                    }
                    if emit_failed {
                        let _ = tx.send(TransportEvent::Failed).await;
                    }
                    if emit_disconnect {
                        let _ = tx.send(TransportEvent::Disconnected).await;
                    }
                })
            }));
        }

        // Local ICE candidates -> signaling.
        {
            let tx = event_tx.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(c) = candidate else { return };
                    match c.to_json() {
                        Ok(json) => {
                            let value = IceCandidateJson {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            };
                            match serde_json::to_string(&value) {
                                Ok(value) => {
                                    let _ = tx
                                        .send(TransportEvent::SignalingMessage {
                                            key: SIG_KEY_CANDIDATE.to_string(),
                                            value,
                                        })
                                        .await;
                                }
                                Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                            }
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                    }
                })
            }));
        }

        // Client-opened data channels.
        {
            let tx = event_tx.clone();
            let control_dc = Arc::clone(&control_dc);
            let bulk_dc = Arc::clone(&bulk_dc);
            pc.on_data_channel(Box::new(move |dc| {
                let tx = tx.clone();
                let control_dc = Arc::clone(&control_dc);
                let bulk_dc = Arc::clone(&bulk_dc);
                Box::pin(async move {
                    let label = dc.label().to_string();
                    let reliable = label == CONTROL_CHANNEL;
                    if label != CONTROL_CHANNEL && label != BULK_CHANNEL {
                        warn!(label, "Unexpected data channel");
                        return;
                    }
                    info!(label, "Data channel opened");
                    {
                        let storage = if reliable { &control_dc } else { &bulk_dc };
                        let mut slot = storage.lock().await;
                        *slot = Some(Arc::clone(&dc));
                    }
                    let tx2 = tx.clone();
                    dc.on_message(Box::new(move |msg| {
                        let tx = tx2.clone();
                        Box::pin(async move {
                            match decode_channel_payload(&msg.data) {
                                Some((msg_type, body)) => {
                                    let _ = tx
                                        .send(TransportEvent::Data {
                                            msg_type,
                                            body,
                                            reliable,
                                        })
                                        .await;
                                }
                                None => warn!("Short data channel payload"),
                            }
                        })
                    }));
                })
            }));
        }

        start_rtcp_reader(
            Arc::clone(&video_sender),
            event_tx.clone(),
            Arc::clone(&bwe_bps),
            Arc::clone(&closing),
        );
        start_stats_loop(
            Arc::clone(&pc),
            event_tx.clone(),
            Arc::clone(&nack),
            Arc::clone(&closing),
        );

        let refresh = params.streaming.screen_refresh_rate.max(1);
        let frame_duration = Duration::from_nanos(1_000_000_000 / refresh as u64);
        let (writer_tx, writer_rx) = mpsc::channel(1024);
        tokio::spawn(writer_task(
            writer_rx,
            video_track,
            audio_track,
            control_dc,
            bulk_dc,
            frame_duration,
        ));

        info!(codec = video_codec.name(), "RTC transport created");
        Ok(RtcTransport {
            pc,
            writer_tx,
            event_tx,
            bwe_bps,
            nack,
            closing,
            disconnect_emitted,
        })
    }

    pub fn send_video(&self, frame: VideoFrame) -> bool {
        self.writer_tx.try_send(WriterCmd::Video(frame)).is_ok()
    }

    pub fn send_audio(&self, audio: AudioData) -> bool {
        self.writer_tx.try_send(WriterCmd::Audio(audio)).is_ok()
    }

    pub fn send_message(&self, msg: &Message, reliable: bool) -> bool {
        let payload = match encode_channel_payload(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode channel payload: {e}");
                return false;
            }
        };
        self.writer_tx
            .try_send(WriterCmd::Data { payload, reliable })
            .is_ok()
    }

    /// Offer/candidate handling. Runs asynchronously; answers come back as
    /// `SignalingMessage` events.
    pub fn on_signaling_message(&self, key: &str, value: &str) {
        let pc = Arc::clone(&self.pc);
        let tx = self.event_tx.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::spawn(async move {
            match key.as_str() {
                SIG_KEY_OFFER => match handle_offer(&pc, &value).await {
                    Ok(answer) => {
                        let _ = tx
                            .send(TransportEvent::SignalingMessage {
                                key: SIG_KEY_ANSWER.to_string(),
                                value: answer,
                            })
                            .await;
                    }
                    Err(e) => warn!("Failed to handle SDP offer: {e:#}"),
                },
                SIG_KEY_CANDIDATE => {
                    if let Err(e) = handle_candidate(&pc, &value).await {
                        warn!("Failed to add ICE candidate: {e:#}");
                    }
                }
                other => debug!(key = other, "Ignoring unknown signaling key"),
            }
        });
    }

    pub fn stats(&self) -> (u32, u32) {
        (
            self.bwe_bps.load(Ordering::Relaxed),
            self.nack.load(Ordering::Relaxed),
        )
    }

    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let pc = Arc::clone(&self.pc);
        let tx = self.event_tx.clone();
        let disconnect_emitted = Arc::clone(&self.disconnect_emitted);
        tokio::spawn(async move {
            if let Err(e) = pc.close().await {
                warn!("Failed to close peer connection: {e}");
            }
            // The state handler usually beats us to it; this is the
            // fallback so the owner always observes Disconnected.
            if !disconnect_emitted.swap(true, Ordering::SeqCst) {
                let _ = tx.send(TransportEvent::Disconnected).await;
            }
        });
    }
}

async fn handle_offer(pc: &Arc<RTCPeerConnection>, sdp: &str) -> Result<String> {
    let offer = RTCSessionDescription::offer(sdp.to_string()).context("Failed to parse offer")?;
    pc.set_remote_description(offer)
        .await
        .context("Failed to set remote description")?;
    let answer = pc
        .create_answer(None)
        .await
        .context("Failed to create answer")?;
    pc.set_local_description(answer.clone())
        .await
        .context("Failed to set local description")?;
    Ok(answer.sdp)
}

async fn handle_candidate(pc: &Arc<RTCPeerConnection>, value: &str) -> Result<()> {
    let json: IceCandidateJson =
        serde_json::from_str(value).context("Malformed ICE candidate json")?;
    pc.add_ice_candidate(RTCIceCandidateInit {
        candidate: json.candidate,
        sdp_mid: json.sdp_mid,
        sdp_mline_index: json.sdp_mline_index,
        ..Default::default()
    })
    .await
    .context("add_ice_candidate failed")
}

/// Read RTCP from the video sender: PLI/FIR become keyframe requests, REMB
/// becomes the bandwidth estimate. Without this, packet loss would corrupt
/// video until the next periodic IDR.
fn start_rtcp_reader(
    sender: Arc<RTCRtpSender>,
    event_tx: mpsc::Sender<TransportEvent>,
    bwe_bps: Arc<AtomicU32>,
    closing: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        while let Ok((packets, _)) = sender.read_rtcp().await {
            if closing.load(Ordering::SeqCst) {
                return;
            }
            for pkt in &packets {
                let pkt_any = pkt.as_any();
                if pkt_any
                    .is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                    || pkt_any
                        .is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                {
                    debug!("Received PLI/FIR keyframe request");
                    if event_tx.send(TransportEvent::KeyframeRequest).await.is_err() {
                        return;
                    }
                } else if let Some(remb) = pkt_any
                    .downcast_ref::<rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate>()
                {
                    let bps = remb.bitrate as u32;
                    bwe_bps.store(bps, Ordering::Relaxed);
                    if event_tx
                        .send(TransportEvent::VideoBitrateUpdate(bps))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    });
}

/// Derive interval loss rate (and the cumulative NACK count) from the stats
/// report once per second.
fn start_stats_loop(
    pc: Arc<RTCPeerConnection>,
    event_tx: mpsc::Sender<TransportEvent>,
    nack: Arc<AtomicU32>,
    closing: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut prev_sent: u64 = 0;
        let mut prev_lost: i64 = 0;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if closing.load(Ordering::SeqCst) {
                return;
            }
            if pc.connection_state() != RTCPeerConnectionState::Connected {
                continue;
            }

            let stats = pc.get_stats().await;
            let mut sent: u64 = 0;
            let mut lost: i64 = 0;
            for (_key, stat) in stats.reports.iter() {
                if let StatsReportType::OutboundRTP(rtp) = stat
                    && rtp.kind == "video"
                {
                    sent = rtp.packets_sent;
                    nack.store(rtp.nack_count as u32, Ordering::Relaxed);
                }
                if let StatsReportType::RemoteInboundRTP(remote) = stat
                    && remote.kind == "video"
                {
                    lost = remote.packets_lost;
                }
            }

            let interval_sent = sent.saturating_sub(prev_sent);
            let interval_lost = (lost - prev_lost).max(0) as u64;
            prev_sent = sent;
            prev_lost = lost;

            let loss_rate = if interval_sent > 0 {
                interval_lost as f32 / interval_sent as f32
            } else {
                0.0
            };
            if event_tx
                .send(TransportEvent::LossRateUpdate(loss_rate))
                .await
                .is_err()
            {
                return;
            }
        }
    });
}

async fn writer_task(
    mut rx: mpsc::Receiver<WriterCmd>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    control_dc: SharedDc,
    bulk_dc: SharedDc,
    frame_duration: Duration,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCmd::Video(frame) => {
                let sample = webrtc::media::Sample {
                    data: frame.frame.clone(),
                    duration: frame_duration,
                    ..Default::default()
                };
                if let Err(e) = video_track.write_sample(&sample).await {
                    debug!("Video sample write failed: {e}");
                }
            }
            WriterCmd::Audio(audio) => {
                let sample = webrtc::media::Sample {
                    data: audio.data.clone(),
                    duration: Duration::from_millis(10),
                    ..Default::default()
                };
                if let Err(e) = audio_track.write_sample(&sample).await {
                    debug!("Audio sample write failed: {e}");
                }
            }
            WriterCmd::Data { payload, reliable } => {
                let storage = if reliable { &control_dc } else { &bulk_dc };
                let dc = { storage.lock().await.clone() };
                // Fall back to the reliable channel when the lossy one
                // never opened.
                let dc = match dc {
                    Some(dc) => Some(dc),
                    None if !reliable => control_dc.lock().await.clone(),
                    None => None,
                };
                match dc {
                    Some(dc) => {
                        if let Err(e) = dc.send(&Bytes::from(payload)).await {
                            debug!("Data channel send failed: {e}");
                        }
                    }
                    None => debug!("Dropping data, channel not open yet"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanthing_proto::messages::StreamingParams;

    fn params(
        use_nbp2p: bool,
        reflex: Vec<String>,
        relay: Vec<String>,
    ) -> (TransportParams, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        (
            TransportParams {
                streaming: StreamingParams {
                    video_codecs: vec![VideoCodecType::H264_420],
                    video_width: 1920,
                    video_height: 1080,
                    screen_refresh_rate: 60,
                    audio_channels: 2,
                    audio_sample_rate: 48000,
                },
                min_port: 0,
                max_port: 0,
                use_nbp2p,
                p2p_username: "user".into(),
                p2p_password: "pass".into(),
                reflex_servers: reflex,
                relay_servers: relay,
                ignored_nic: String::new(),
                event_tx,
            },
            event_rx,
        )
    }

    #[test]
    fn default_stun_without_nbp2p() {
        let (p, _rx) = params(false, vec!["reflex.example:3478".into()], vec![]);
        let servers = build_ice_servers(&p);
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls[0].starts_with("stun:stun.l.google.com"));
    }

    #[test]
    fn nbp2p_maps_reflex_and_relay_lists() {
        let (p, _rx) = params(
            true,
            vec!["reflex.example:3478".into(), "stun:already.example:3478".into()],
            vec!["relay.example:3478".into()],
        );
        let servers = build_ice_servers(&p);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls[0], "stun:reflex.example:3478");
        assert_eq!(servers[0].urls[1], "stun:already.example:3478");
        assert_eq!(servers[1].urls[0], "turn:relay.example:3478");
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "pass");
    }

    #[test]
    fn candidate_json_roundtrip() {
        let json = r#"{"candidate":"candidate:1 1 UDP 999 1.2.3.4 50000 typ host","sdp_mid":"0","sdp_mline_index":0}"#;
        let parsed: IceCandidateJson = serde_json::from_str(json).unwrap();
        assert!(parsed.candidate.starts_with("candidate:1"));
        assert_eq!(parsed.sdp_mid.as_deref(), Some("0"));
        assert_eq!(parsed.sdp_mline_index, Some(0));
    }

    #[test]
    fn h265_gets_its_own_mime() {
        assert_eq!(
            video_capability(VideoCodecType::H265_420).mime_type,
            MIME_TYPE_H265
        );
        assert_eq!(
            video_capability(VideoCodecType::H264_444).mime_type,
            MIME_TYPE_H264
        );
    }

    #[tokio::test]
    async fn transport_builds_and_closes() {
        let (p, mut rx) = params(false, vec![], vec![]);
        let transport = RtcTransport::new(p).await.unwrap();
        assert_eq!(transport.stats(), (0, 0));
        transport.close();
        transport.close();
        // Exactly one Disconnected, possibly after state-change noise.
        let mut disconnects = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        {
            if matches!(event, TransportEvent::Disconnected) {
                disconnects += 1;
                break;
            }
        }
        assert_eq!(disconnects, 1);
    }
}
