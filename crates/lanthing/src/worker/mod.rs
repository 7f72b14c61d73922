//! Worker-side runtime: what the binary does when re-executed with
//! `-type worker`.
//!
//! The worker dials the session's pipe, reports the negotiated streaming
//! parameters, and from then on is driven entirely by pipe messages. Capture,
//! encoding and input injection are vendor integrations behind
//! [`MediaBackend`]; the runtime owns the protocol and the exit-code
//! contract, including its own pipe-silence watchdog.

use std::time::Duration;

use bytes::Bytes;
use lanthing_proto::error::{
    EXIT_CODE_INIT_AUDIO_FAILED, EXIT_CODE_INIT_INPUT_FAILED, EXIT_CODE_INIT_VIDEO_FAILED,
    EXIT_CODE_INIT_WORKER_FAILED, EXIT_CODE_OK, EXIT_CODE_TIMEOUT, ErrorCode,
};
use lanthing_proto::media::{AudioData, VideoFrame};
use lanthing_proto::messages::{
    CursorInfo, Message, StartWorkingAck, StreamingParams, VideoCodecType, msg_type,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::net::{Client, ClientEvent, ClientParams, Endpoint};
use crate::util::now_us;

/// The session pings every 500 ms; two seconds of silence means it is gone.
const PIPE_SILENCE_LIMIT: Duration = Duration::from_secs(2);
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(500);

/// Parsed `-type worker` command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub pipe_name: String,
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub codecs: Vec<VideoCodecType>,
    pub monitor_index: u32,
    /// First launch: re-run codec/resolution selection. Relaunches reuse
    /// the already-chosen parameters from the command line.
    pub negotiate: bool,
}

/// Why the media pipeline failed to come up. Maps onto both the ack error
/// and the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    Worker,
    Video,
    Audio,
    Input,
}

impl InitError {
    pub fn exit_code(self) -> i32 {
        match self {
            InitError::Worker => EXIT_CODE_INIT_WORKER_FAILED,
            InitError::Video => EXIT_CODE_INIT_VIDEO_FAILED,
            InitError::Audio => EXIT_CODE_INIT_AUDIO_FAILED,
            InitError::Input => EXIT_CODE_INIT_INPUT_FAILED,
        }
    }

    pub fn error_code(self) -> ErrorCode {
        match self {
            InitError::Worker => ErrorCode::ControlledInitFailed,
            InitError::Video => ErrorCode::WorkerInitVideoFailed,
            InitError::Audio => ErrorCode::WorkerInitAudioFailed,
            InitError::Input => ErrorCode::WorkerInitInputFailed,
        }
    }
}

/// Captured media flowing out of the backend.
#[derive(Debug)]
pub enum MediaEvent {
    Video(VideoFrame),
    Audio(AudioData),
    Cursor(CursorInfo),
}

/// Seam for the OS capture/encoder/injection integrations.
pub trait MediaBackend: Send {
    /// Codecs this build can actually encode, in preference order.
    fn supported_codecs(&self) -> Vec<VideoCodecType>;

    /// Bring up capture/encode/inject for the negotiated parameters.
    fn start(
        &mut self,
        params: &StreamingParams,
        media_tx: mpsc::Sender<MediaEvent>,
    ) -> Result<(), InitError>;

    fn stop(&mut self);

    fn request_keyframe(&mut self);

    fn reconfigure_bitrate(&mut self, bitrate_bps: u32);

    /// Inject a forwarded input event; the payload stays in wire form.
    fn inject_input(&mut self, msg_type: u32, body: &Bytes);

    fn set_clipboard(&mut self, text: &str);

    /// Peer message ids the session should forward to this worker.
    fn registered_msg_types(&self) -> Vec<u32> {
        vec![
            msg_type::KEYBOARD_EVENT,
            msg_type::MOUSE_EVENT,
            msg_type::WHEEL_EVENT,
            msg_type::GAMEPAD_EVENT,
            msg_type::CLIPBOARD,
        ]
    }
}

/// Placeholder backend for builds without a capture stack. Negotiates and
/// answers the protocol but produces no frames.
pub struct StubBackend;

impl MediaBackend for StubBackend {
    fn supported_codecs(&self) -> Vec<VideoCodecType> {
        vec![VideoCodecType::H264_420, VideoCodecType::H265_420]
    }

    fn start(
        &mut self,
        params: &StreamingParams,
        _media_tx: mpsc::Sender<MediaEvent>,
    ) -> Result<(), InitError> {
        info!(width = params.video_width, height = params.video_height,
              "Stub media backend started");
        Ok(())
    }

    fn stop(&mut self) {}

    fn request_keyframe(&mut self) {}

    fn reconfigure_bitrate(&mut self, bitrate_bps: u32) {
        debug!(bitrate_bps, "Stub backend ignoring bitrate change");
    }

    fn inject_input(&mut self, msg_type: u32, _body: &Bytes) {
        debug!(msg_type, "Stub backend dropping input event");
    }

    fn set_clipboard(&mut self, _text: &str) {}
}

/// Pick streaming parameters from the client's request and the backend's
/// abilities: first requested codec the encoder supports wins.
pub fn negotiate_params(
    args: &WorkerArgs,
    supported: &[VideoCodecType],
) -> Option<StreamingParams> {
    let codec = args.codecs.iter().find(|c| supported.contains(c))?;
    Some(StreamingParams {
        video_codecs: vec![*codec],
        video_width: args.width,
        video_height: args.height,
        screen_refresh_rate: args.refresh_rate,
        audio_channels: 2,
        audio_sample_rate: 48000,
    })
}

pub async fn run_worker(args: WorkerArgs) -> i32 {
    run_worker_with_backend(args, Box::new(StubBackend)).await
}

pub async fn run_worker_with_backend(args: WorkerArgs, mut backend: Box<dyn MediaBackend>) -> i32 {
    info!(pipe = %args.pipe_name, negotiate = args.negotiate, "Worker starting");

    let Some(params) = negotiate_params(&args, &backend.supported_codecs()) else {
        warn!("No mutually supported video codec");
        return EXIT_CODE_INIT_WORKER_FAILED;
    };

    // One shot: if the session's pipe is gone, so are we.
    let (pipe, mut pipe_rx) = Client::connect(ClientParams {
        reconnect: false,
        ..ClientParams::new(Endpoint::Pipe {
            name: args.pipe_name.clone(),
        })
    });

    // Wait for the connection before speaking.
    match pipe_rx.recv().await {
        Some(ClientEvent::Connected) => {}
        _ => {
            warn!("Could not reach the session pipe");
            return EXIT_CODE_INIT_WORKER_FAILED;
        }
    }
    pipe.send(&Message::StreamingParams(params.clone()));

    let (media_tx, mut media_rx) = mpsc::channel::<MediaEvent>(256);
    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
    let mut last_traffic_us = now_us();
    let mut working = false;

    loop {
        tokio::select! {
            event = pipe_rx.recv() => {
                let packet = match event {
                    Some(ClientEvent::Message(packet)) => packet,
                    Some(ClientEvent::Connected) | Some(ClientEvent::Reconnecting) => continue,
                    Some(ClientEvent::Disconnected) | None => {
                        warn!("Session pipe closed");
                        backend.stop();
                        return EXIT_CODE_TIMEOUT;
                    }
                };
                last_traffic_us = now_us();
                match packet.msg_type {
                    msg_type::KEEP_ALIVE => {}
                    msg_type::START_WORKING => {
                        match backend.start(&params, media_tx.clone()) {
                            Ok(()) => {
                                working = true;
                                pipe.send(&Message::StartWorkingAck(StartWorkingAck {
                                    err_code: ErrorCode::Success,
                                    msg_types: backend.registered_msg_types(),
                                }));
                            }
                            Err(init_err) => {
                                warn!(?init_err, "Media backend failed to start");
                                pipe.send(&Message::StartWorkingAck(StartWorkingAck {
                                    err_code: init_err.error_code(),
                                    msg_types: vec![],
                                }));
                                return init_err.exit_code();
                            }
                        }
                    }
                    msg_type::STOP_WORKING => {
                        info!("StopWorking received, exiting");
                        backend.stop();
                        return EXIT_CODE_OK;
                    }
                    msg_type::REQUEST_KEYFRAME => backend.request_keyframe(),
                    msg_type::RECONFIGURE_VIDEO_ENCODER => {
                        match Message::decode(packet.msg_type, packet.body) {
                            Ok(Message::ReconfigureVideoEncoder(cfg)) => {
                                backend.reconfigure_bitrate(cfg.bitrate_bps);
                            }
                            other => warn!("Bad ReconfigureVideoEncoder: {other:?}"),
                        }
                    }
                    msg_type::CLIPBOARD => {
                        match Message::decode(packet.msg_type, packet.body) {
                            Ok(Message::Clipboard(clip)) => backend.set_clipboard(&clip.text),
                            other => warn!("Bad Clipboard: {other:?}"),
                        }
                    }
                    msg_type::KEYBOARD_EVENT
                    | msg_type::MOUSE_EVENT
                    | msg_type::WHEEL_EVENT
                    | msg_type::GAMEPAD_EVENT => {
                        if working {
                            backend.inject_input(packet.msg_type, &packet.body);
                        }
                    }
                    other => warn!(msg_type = other, "Unknown message from session"),
                }
            }
            Some(media) = media_rx.recv() => {
                match media {
                    MediaEvent::Video(frame) => {
                        pipe.send(&Message::VideoFrame(frame));
                    }
                    MediaEvent::Audio(audio) => {
                        pipe.send(&Message::AudioData(audio));
                    }
                    MediaEvent::Cursor(cursor) => {
                        pipe.send(&Message::CursorInfo(cursor));
                    }
                }
            }
            _ = watchdog.tick() => {
                let silence_us = now_us() - last_traffic_us;
                if silence_us > PIPE_SILENCE_LIMIT.as_micros() as i64 {
                    warn!(silence_us, "Session keepalive timeout");
                    backend.stop();
                    return EXIT_CODE_TIMEOUT;
                }
            }
        }
    }
}
