//! Typed message registry.
//!
//! Every wire message is a `u32` type tag plus a payload. Structured
//! payloads are serde JSON; `VideoFrame`/`AudioData` use the binary layouts
//! in [`crate::media`]. Unknown tags decode to [`Message::Unknown`] so a
//! single unrecognized message never costs the connection.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::frame::Packet;
use crate::media::{AudioData, VideoFrame};

/// Message type tags. Grouped by the link they travel on; pass-through input
/// ids live in the 41xx block so the session can forward them without
/// understanding them.
pub mod msg_type {
    // Common
    pub const KEEP_ALIVE: u32 = 1001;
    pub const KEEP_ALIVE_ACK: u32 = 1002;
    pub const STREAMING_PARAMS: u32 = 1003;

    // Rendezvous server <-> service
    pub const LOGIN_DEVICE: u32 = 2001;
    pub const LOGIN_DEVICE_ACK: u32 = 2002;
    pub const ALLOCATE_DEVICE_ID: u32 = 2003;
    pub const ALLOCATE_DEVICE_ID_ACK: u32 = 2004;
    pub const OPEN_CONNECTION: u32 = 2005;
    pub const OPEN_CONNECTION_ACK: u32 = 2006;
    pub const CLOSE_CONNECTION: u32 = 2007;

    // Signaling
    pub const JOIN_ROOM: u32 = 3001;
    pub const JOIN_ROOM_ACK: u32 = 3002;
    pub const SIGNALING_MESSAGE: u32 = 3003;
    pub const SIGNALING_MESSAGE_ACK: u32 = 3004;

    // Peer <-> peer data channel
    pub const START_TRANSMISSION: u32 = 4001;
    pub const START_TRANSMISSION_ACK: u32 = 4002;
    pub const TIME_SYNC: u32 = 4003;
    pub const SEND_SIDE_STAT: u32 = 4004;
    pub const VIDEO_FRAME: u32 = 4005;
    pub const AUDIO_DATA: u32 = 4006;
    pub const REQUEST_KEYFRAME: u32 = 4007;
    pub const RECONFIGURE_VIDEO_ENCODER: u32 = 4008;

    // Pass-through input / presentation ids
    pub const KEYBOARD_EVENT: u32 = 4101;
    pub const MOUSE_EVENT: u32 = 4102;
    pub const WHEEL_EVENT: u32 = 4103;
    pub const GAMEPAD_EVENT: u32 = 4104;
    pub const CURSOR_INFO: u32 = 4105;
    pub const CLIPBOARD: u32 = 4106;

    // Worker <-> session pipe
    pub const START_WORKING: u32 = 5001;
    pub const START_WORKING_ACK: u32 = 5002;
    pub const STOP_WORKING: u32 = 5003;

    // Service <-> app pipe
    pub const CONFIRM_CONNECTION: u32 = 6001;
    pub const CONFIRM_CONNECTION_ACK: u32 = 6002;
    pub const SERVICE_STATUS: u32 = 6003;
    pub const ACCEPTED_CONNECTION: u32 = 6004;
    pub const DISCONNECTED_CONNECTION: u32 = 6005;
    pub const CONNECTION_STATUS: u32 = 6006;
    pub const OPERATE_CONNECTION: u32 = 6007;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    Tcp,
    Rtc,
    ForceRtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsType {
    Unknown,
    Windows,
    Linux,
    MacOs,
}

impl OsType {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            OsType::Windows
        } else if cfg!(target_os = "linux") {
            OsType::Linux
        } else if cfg!(target_os = "macos") {
            OsType::MacOs
        } else {
            OsType::Unknown
        }
    }
}

/// Codec + chroma subsampling, named with the original CSV spellings used on
/// the worker command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodecType {
    H264_420,
    H265_420,
    H264_444,
    H265_444,
}

impl VideoCodecType {
    pub fn name(self) -> &'static str {
        match self {
            VideoCodecType::H264_420 => "avc",
            VideoCodecType::H265_420 => "hevc",
            VideoCodecType::H264_444 => "avc444",
            VideoCodecType::H265_444 => "hevc444",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "avc" => Some(VideoCodecType::H264_420),
            "hevc" => Some(VideoCodecType::H265_420),
            "avc444" => Some(VideoCodecType::H264_444),
            "hevc444" => Some(VideoCodecType::H265_444),
            _ => None,
        }
    }
}

/// Join an ordered codec preference list into the `-codecs` CLI value.
pub fn codecs_to_csv(codecs: &[VideoCodecType]) -> String {
    codecs
        .iter()
        .map(|c| c.name())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a `-codecs` CLI value, dropping names this build doesn't know.
pub fn codecs_from_csv(csv: &str) -> Vec<VideoCodecType> {
    csv.split(',')
        .filter_map(|name| VideoCodecType::from_name(name.trim()))
        .collect()
}

/// Negotiated (or requested) streaming parameters. Immutable once the worker
/// reports its choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingParams {
    pub video_codecs: Vec<VideoCodecType>,
    pub video_width: u32,
    pub video_height: u32,
    pub screen_refresh_rate: u32,
    pub audio_channels: u32,
    pub audio_sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseConnectionReason {
    ClientClose,
    HostClose,
    TimeoutClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingLevel {
    Core,
    Rtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmResult {
    Agree,
    Reject,
    AgreeNextTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    EnableMouse,
    DisableMouse,
    EnableKeyboard,
    DisableKeyboard,
    EnableGamepad,
    DisableGamepad,
    EnableAudio,
    DisableAudio,
    Kick,
}

// --- Server <-> service payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginDevice {
    pub device_id: i64,
    pub version_major: i32,
    pub version_minor: i32,
    pub version_patch: i32,
    pub allow_control: bool,
    pub cookie: String,
    pub os_type: OsType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginDeviceAck {
    pub err_code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateDeviceIdAck {
    pub device_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenConnection {
    pub client_device_id: i64,
    pub client_version: i64,
    pub required_version: i64,
    pub access_token: String,
    pub cookie: String,
    pub transport_type: TransportType,
    pub streaming_params: Option<StreamingParams>,
    pub signaling_addr: String,
    pub signaling_port: u16,
    pub auth_token: String,
    pub room_id: String,
    pub p2p_username: String,
    pub p2p_password: String,
    pub reflex_servers: Vec<String>,
    pub relay_servers: Vec<String>,
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenConnectionAck {
    pub err_code: ErrorCode,
    pub transport_type: TransportType,
    pub streaming_params: Option<StreamingParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseConnection {
    pub reason: CloseConnectionReason,
    pub room_id: String,
}

// --- Signaling payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoom {
    pub session_id: String,
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoomAck {
    pub err_code: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub level: SignalingLevel,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessageAck {
    pub err_code: ErrorCode,
}

// --- Peer <-> peer payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTransmission {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTransmissionAck {
    pub err_code: ErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSync {
    pub t0: i64,
    pub t1: i64,
    pub t2: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendSideStat {
    pub bwe: u32,
    pub nack: u32,
    pub loss_rate: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconfigureVideoEncoder {
    pub bitrate_bps: u32,
}

// --- Input / presentation payloads (opaque to the session core) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardEvent {
    /// Platform scan code.
    pub key: u32,
    pub down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouseEvent {
    /// Normalized 0.0..=1.0 coordinates.
    pub x: f32,
    pub y: f32,
    /// 0 = move only, 1 = left, 2 = middle, 3 = right.
    pub button: u8,
    pub down: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelEvent {
    pub delta: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GamepadEvent {
    pub index: u32,
    pub buttons: u32,
    pub left_trigger: u8,
    pub right_trigger: u8,
    pub left_stick_x: i16,
    pub left_stick_y: i16,
    pub right_stick_x: i16,
    pub right_stick_y: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorInfo {
    pub cursor_id: u32,
    pub x: f32,
    pub y: f32,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clipboard {
    pub text: String,
}

// --- Worker <-> session payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartWorkingAck {
    pub err_code: ErrorCode,
    /// Message ids the worker wants forwarded from the peer.
    pub msg_types: Vec<u32>,
}

// --- Service <-> app payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmConnection {
    pub device_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmConnectionAck {
    pub result: ConfirmResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptedConnection {
    pub device_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectedConnection {
    pub device_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub device_id: i64,
    pub rtt_us: i64,
    pub loss_rate: f32,
    pub enable_mouse: bool,
    pub enable_keyboard: bool,
    pub enable_gamepad: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperateConnection {
    pub operations: Vec<Operation>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload for message type {msg_type}")]
    Json {
        msg_type: u32,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Media(#[from] crate::media::MediaError),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to encode message type {msg_type}")]
pub struct EncodeError {
    pub msg_type: u32,
    #[source]
    source: serde_json::Error,
}

/// Every message the core understands, plus `Unknown` for everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    KeepAliveAck,
    StreamingParams(StreamingParams),

    LoginDevice(LoginDevice),
    LoginDeviceAck(LoginDeviceAck),
    AllocateDeviceId,
    AllocateDeviceIdAck(AllocateDeviceIdAck),
    OpenConnection(Box<OpenConnection>),
    OpenConnectionAck(OpenConnectionAck),
    CloseConnection(CloseConnection),

    JoinRoom(JoinRoom),
    JoinRoomAck(JoinRoomAck),
    SignalingMessage(SignalingMessage),
    SignalingMessageAck(SignalingMessageAck),

    StartTransmission(StartTransmission),
    StartTransmissionAck(StartTransmissionAck),
    TimeSync(TimeSync),
    SendSideStat(SendSideStat),
    VideoFrame(VideoFrame),
    AudioData(AudioData),
    RequestKeyframe,
    ReconfigureVideoEncoder(ReconfigureVideoEncoder),

    KeyboardEvent(KeyboardEvent),
    MouseEvent(MouseEvent),
    WheelEvent(WheelEvent),
    GamepadEvent(GamepadEvent),
    CursorInfo(CursorInfo),
    Clipboard(Clipboard),

    StartWorking,
    StartWorkingAck(StartWorkingAck),
    StopWorking,

    ConfirmConnection(ConfirmConnection),
    ConfirmConnectionAck(ConfirmConnectionAck),
    ServiceStatus(ServiceStatus),
    AcceptedConnection(AcceptedConnection),
    DisconnectedConnection(DisconnectedConnection),
    ConnectionStatus(ConnectionStatus),
    OperateConnection(OperateConnection),

    Unknown { msg_type: u32, body: Bytes },
}

impl Message {
    pub fn msg_type(&self) -> u32 {
        use self::msg_type::*;
        match self {
            Message::KeepAlive => KEEP_ALIVE,
            Message::KeepAliveAck => KEEP_ALIVE_ACK,
            Message::StreamingParams(_) => STREAMING_PARAMS,
            Message::LoginDevice(_) => LOGIN_DEVICE,
            Message::LoginDeviceAck(_) => LOGIN_DEVICE_ACK,
            Message::AllocateDeviceId => ALLOCATE_DEVICE_ID,
            Message::AllocateDeviceIdAck(_) => ALLOCATE_DEVICE_ID_ACK,
            Message::OpenConnection(_) => OPEN_CONNECTION,
            Message::OpenConnectionAck(_) => OPEN_CONNECTION_ACK,
            Message::CloseConnection(_) => CLOSE_CONNECTION,
            Message::JoinRoom(_) => JOIN_ROOM,
            Message::JoinRoomAck(_) => JOIN_ROOM_ACK,
            Message::SignalingMessage(_) => SIGNALING_MESSAGE,
            Message::SignalingMessageAck(_) => SIGNALING_MESSAGE_ACK,
            Message::StartTransmission(_) => START_TRANSMISSION,
            Message::StartTransmissionAck(_) => START_TRANSMISSION_ACK,
            Message::TimeSync(_) => TIME_SYNC,
            Message::SendSideStat(_) => SEND_SIDE_STAT,
            Message::VideoFrame(_) => VIDEO_FRAME,
            Message::AudioData(_) => AUDIO_DATA,
            Message::RequestKeyframe => REQUEST_KEYFRAME,
            Message::ReconfigureVideoEncoder(_) => RECONFIGURE_VIDEO_ENCODER,
            Message::KeyboardEvent(_) => KEYBOARD_EVENT,
            Message::MouseEvent(_) => MOUSE_EVENT,
            Message::WheelEvent(_) => WHEEL_EVENT,
            Message::GamepadEvent(_) => GAMEPAD_EVENT,
            Message::CursorInfo(_) => CURSOR_INFO,
            Message::Clipboard(_) => CLIPBOARD,
            Message::StartWorking => START_WORKING,
            Message::StartWorkingAck(_) => START_WORKING_ACK,
            Message::StopWorking => STOP_WORKING,
            Message::ConfirmConnection(_) => CONFIRM_CONNECTION,
            Message::ConfirmConnectionAck(_) => CONFIRM_CONNECTION_ACK,
            Message::ServiceStatus(_) => SERVICE_STATUS,
            Message::AcceptedConnection(_) => ACCEPTED_CONNECTION,
            Message::DisconnectedConnection(_) => DISCONNECTED_CONNECTION,
            Message::ConnectionStatus(_) => CONNECTION_STATUS,
            Message::OperateConnection(_) => OPERATE_CONNECTION,
            Message::Unknown { msg_type, .. } => *msg_type,
        }
    }

    /// Serialize into a wire packet.
    pub fn to_packet(&self) -> Result<Packet, EncodeError> {
        fn json<T: Serialize>(msg_type: u32, value: &T) -> Result<Vec<u8>, EncodeError> {
            serde_json::to_vec(value).map_err(|source| EncodeError { msg_type, source })
        }

        let msg_type = self.msg_type();
        let body = match self {
            Message::KeepAlive
            | Message::KeepAliveAck
            | Message::AllocateDeviceId
            | Message::RequestKeyframe
            | Message::StartWorking
            | Message::StopWorking => Vec::new(),
            Message::StreamingParams(m) => json(msg_type, m)?,
            Message::LoginDevice(m) => json(msg_type, m)?,
            Message::LoginDeviceAck(m) => json(msg_type, m)?,
            Message::AllocateDeviceIdAck(m) => json(msg_type, m)?,
            Message::OpenConnection(m) => json(msg_type, m)?,
            Message::OpenConnectionAck(m) => json(msg_type, m)?,
            Message::CloseConnection(m) => json(msg_type, m)?,
            Message::JoinRoom(m) => json(msg_type, m)?,
            Message::JoinRoomAck(m) => json(msg_type, m)?,
            Message::SignalingMessage(m) => json(msg_type, m)?,
            Message::SignalingMessageAck(m) => json(msg_type, m)?,
            Message::StartTransmission(m) => json(msg_type, m)?,
            Message::StartTransmissionAck(m) => json(msg_type, m)?,
            Message::TimeSync(m) => json(msg_type, m)?,
            Message::SendSideStat(m) => json(msg_type, m)?,
            Message::VideoFrame(m) => m.serialize(),
            Message::AudioData(m) => m.serialize(),
            Message::ReconfigureVideoEncoder(m) => json(msg_type, m)?,
            Message::KeyboardEvent(m) => json(msg_type, m)?,
            Message::MouseEvent(m) => json(msg_type, m)?,
            Message::WheelEvent(m) => json(msg_type, m)?,
            Message::GamepadEvent(m) => json(msg_type, m)?,
            Message::CursorInfo(m) => json(msg_type, m)?,
            Message::Clipboard(m) => json(msg_type, m)?,
            Message::StartWorkingAck(m) => json(msg_type, m)?,
            Message::ConfirmConnection(m) => json(msg_type, m)?,
            Message::ConfirmConnectionAck(m) => json(msg_type, m)?,
            Message::ServiceStatus(m) => json(msg_type, m)?,
            Message::AcceptedConnection(m) => json(msg_type, m)?,
            Message::DisconnectedConnection(m) => json(msg_type, m)?,
            Message::ConnectionStatus(m) => json(msg_type, m)?,
            Message::OperateConnection(m) => json(msg_type, m)?,
            Message::Unknown { body, .. } => body.to_vec(),
        };
        Ok(Packet::new(msg_type, body))
    }

    /// Decode a packet payload by its registered type.
    pub fn decode(msg_type: u32, body: Bytes) -> Result<Message, DecodeError> {
        use self::msg_type::*;

        fn json<'a, T: Deserialize<'a>>(msg_type: u32, body: &'a [u8]) -> Result<T, DecodeError> {
            serde_json::from_slice(body).map_err(|source| DecodeError::Json { msg_type, source })
        }

        Ok(match msg_type {
            KEEP_ALIVE => Message::KeepAlive,
            KEEP_ALIVE_ACK => Message::KeepAliveAck,
            STREAMING_PARAMS => Message::StreamingParams(json(msg_type, &body)?),
            LOGIN_DEVICE => Message::LoginDevice(json(msg_type, &body)?),
            LOGIN_DEVICE_ACK => Message::LoginDeviceAck(json(msg_type, &body)?),
            ALLOCATE_DEVICE_ID => Message::AllocateDeviceId,
            ALLOCATE_DEVICE_ID_ACK => Message::AllocateDeviceIdAck(json(msg_type, &body)?),
            OPEN_CONNECTION => Message::OpenConnection(Box::new(json(msg_type, &body)?)),
            OPEN_CONNECTION_ACK => Message::OpenConnectionAck(json(msg_type, &body)?),
            CLOSE_CONNECTION => Message::CloseConnection(json(msg_type, &body)?),
            JOIN_ROOM => Message::JoinRoom(json(msg_type, &body)?),
            JOIN_ROOM_ACK => Message::JoinRoomAck(json(msg_type, &body)?),
            SIGNALING_MESSAGE => Message::SignalingMessage(json(msg_type, &body)?),
            SIGNALING_MESSAGE_ACK => Message::SignalingMessageAck(json(msg_type, &body)?),
            START_TRANSMISSION => Message::StartTransmission(json(msg_type, &body)?),
            START_TRANSMISSION_ACK => Message::StartTransmissionAck(json(msg_type, &body)?),
            TIME_SYNC => Message::TimeSync(json(msg_type, &body)?),
            SEND_SIDE_STAT => Message::SendSideStat(json(msg_type, &body)?),
            VIDEO_FRAME => Message::VideoFrame(VideoFrame::deserialize(&body)?),
            AUDIO_DATA => Message::AudioData(AudioData::deserialize(&body)),
            REQUEST_KEYFRAME => Message::RequestKeyframe,
            RECONFIGURE_VIDEO_ENCODER => {
                Message::ReconfigureVideoEncoder(json(msg_type, &body)?)
            }
            KEYBOARD_EVENT => Message::KeyboardEvent(json(msg_type, &body)?),
            MOUSE_EVENT => Message::MouseEvent(json(msg_type, &body)?),
            WHEEL_EVENT => Message::WheelEvent(json(msg_type, &body)?),
            GAMEPAD_EVENT => Message::GamepadEvent(json(msg_type, &body)?),
            CURSOR_INFO => Message::CursorInfo(json(msg_type, &body)?),
            CLIPBOARD => Message::Clipboard(json(msg_type, &body)?),
            START_WORKING => Message::StartWorking,
            START_WORKING_ACK => Message::StartWorkingAck(json(msg_type, &body)?),
            STOP_WORKING => Message::StopWorking,
            CONFIRM_CONNECTION => Message::ConfirmConnection(json(msg_type, &body)?),
            CONFIRM_CONNECTION_ACK => Message::ConfirmConnectionAck(json(msg_type, &body)?),
            SERVICE_STATUS => Message::ServiceStatus(json(msg_type, &body)?),
            ACCEPTED_CONNECTION => Message::AcceptedConnection(json(msg_type, &body)?),
            DISCONNECTED_CONNECTION => Message::DisconnectedConnection(json(msg_type, &body)?),
            CONNECTION_STATUS => Message::ConnectionStatus(json(msg_type, &body)?),
            OPERATE_CONNECTION => Message::OperateConnection(json(msg_type, &body)?),
            _ => Message::Unknown { msg_type, body },
        })
    }
}
