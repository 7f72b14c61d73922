//! Per-connection worker session.
//!
//! Created by the service from a validated OpenConnection. The session owns
//! a signaling client, a pipe server for the worker child, the worker
//! process supervisor, and, once both the room join and the worker's
//! negotiated parameters are in, the peer transport. Every piece reports
//! into one task, so all session state mutates in one place.
//!
//! Two single-fire notifications leave the session: `CreateCompleted` (after
//! both async creation preconditions resolve) and `Closed` (after the
//! transport confirmed disconnection and the worker process stopped).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lanthing_proto::ErrorCode;
use lanthing_proto::frame::Packet;
use lanthing_proto::media::VideoFrame;
use lanthing_proto::messages::{
    Clipboard, ConnectionStatus, Message, Operation, ReconfigureVideoEncoder, SendSideStat,
    StartTransmissionAck, StreamingParams, TimeSync as TimeSyncMsg, TransportType, msg_type,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::net::{Endpoint, Server, ServerEvent};
use crate::signaling::{SignalingClient, SignalingEvent};
use crate::time_sync::TimeSync;
use crate::transport::{Transport, TransportEvent, TransportParams};
use crate::util::{now_us, random_pipe_suffix};

use super::worker_process::{
    WorkerLaunchSpec, WorkerLauncher, WorkerProcess, WorkerProcessEvent,
};

const WORKER_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);
const TIME_SYNC_INTERVAL: Duration = Duration::from_millis(500);
const STAT_INTERVAL: Duration = Duration::from_secs(1);
const PEER_TIMEOUT: Duration = Duration::from_secs(3);
/// How long a closing session waits for the worker to honor StopWorking
/// before the supervisor terminates it.
const STOP_WORKER_GRACE: Duration = Duration::from_secs(2);

/// Why the session ended. Reported once through `SessionEvent::Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Signaling core close or peer-initiated transport close.
    ClientClose,
    /// The worker process exited.
    HostClose,
    /// No peer data for the timeout window, or the transport failed.
    TimeoutClose,
    /// The user kicked the client from the app.
    UserKick,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// Fired exactly once, when creation either completed or failed.
    CreateCompleted {
        error_code: ErrorCode,
        transport_type: TransportType,
        device_id: i64,
        name: String,
        params: Option<StreamingParams>,
    },
    /// Fired exactly once; nothing is delivered after it.
    Closed {
        device_id: i64,
        reason: CloseReason,
        name: String,
        room_id: String,
    },
    /// The remote client finished the transport handshake.
    AcceptedClient { device_id: i64 },
    ConnectionStatus(ConnectionStatus),
    /// Clipboard content received from the peer, for the app.
    RemoteClipboard(Clipboard),
}

pub struct SessionParams {
    pub name: String,
    pub peer_device_id: i64,
    pub auth_token: String,
    pub service_id: String,
    pub room_id: String,
    pub signaling_addr: String,
    pub signaling_port: u16,
    pub p2p_username: String,
    pub p2p_password: String,
    pub reflex_servers: Vec<String>,
    pub relay_servers: Vec<String>,
    pub transport_type: TransportType,
    /// The client's requested streaming parameters (validated non-empty).
    pub client_params: StreamingParams,
    pub enable_mouse: bool,
    pub enable_keyboard: bool,
    pub enable_gamepad: bool,
    pub min_port: u16,
    pub max_port: u16,
    pub ignored_nic: String,
    pub monitor_index: u32,
    pub worker_program: PathBuf,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub event_tx: mpsc::Sender<SessionEvent>,
}

enum SessionCommand {
    Operate(Vec<Operation>),
    AppClipboard(Clipboard),
}

/// Service-side handle. Dropping it does not kill the session; teardown is
/// always an explicit message so no callback destroys the session from its
/// own stack.
pub struct SessionHandle {
    pub name: String,
    pub peer_device_id: i64,
    pub room_id: String,
    /// Exposed so the service (and tests) can find the worker endpoint.
    pub pipe_name: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn operate(&self, operations: Vec<Operation>) {
        let _ = self.cmd_tx.try_send(SessionCommand::Operate(operations));
    }

    pub fn app_clipboard(&self, clipboard: Clipboard) {
        let _ = self.cmd_tx.try_send(SessionCommand::AppClipboard(clipboard));
    }
}

pub struct WorkerSession;

impl WorkerSession {
    /// Start the session task. Completion (or failure) arrives later as
    /// `SessionEvent::CreateCompleted`.
    pub fn spawn(params: SessionParams) -> SessionHandle {
        let pipe_name = format!("Lanthing_worker_{}", random_pipe_suffix());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let handle = SessionHandle {
            name: params.name.clone(),
            peer_device_id: params.peer_device_id,
            room_id: params.room_id.clone(),
            pipe_name: pipe_name.clone(),
            cmd_tx,
        };
        tokio::spawn(session_task(params, pipe_name, cmd_rx));
        handle
    }
}

async fn session_task(
    params: SessionParams,
    pipe_name: String,
    cmd_rx: mpsc::Receiver<SessionCommand>,
) {
    let event_tx = params.event_tx.clone();
    let (pipe_server, pipe_rx) = match Server::bind(Endpoint::Pipe {
        name: pipe_name.clone(),
    })
    .await
    {
        Ok(ok) => ok,
        Err(e) => {
            warn!(session = %params.name, "Init worker pipe server failed: {e:#}");
            let _ = event_tx
                .send(SessionEvent::CreateCompleted {
                    error_code: ErrorCode::ControlledInitFailed,
                    transport_type: params.transport_type,
                    device_id: params.peer_device_id,
                    name: params.name.clone(),
                    params: None,
                })
                .await;
            return;
        }
    };

    let (worker_tx, worker_rx) = mpsc::channel(16);
    let worker_process = WorkerProcess::launch(
        WorkerLaunchSpec {
            program: params.worker_program.clone(),
            pipe_name: pipe_name.clone(),
            width: params.client_params.video_width,
            height: params.client_params.video_height,
            refresh_rate: params.client_params.screen_refresh_rate,
            codecs: params.client_params.video_codecs.clone(),
            monitor_index: params.monitor_index,
        },
        Arc::clone(&params.launcher),
        worker_tx,
    );

    let (signaling, signaling_rx) = SignalingClient::connect(
        params.signaling_addr.clone(),
        params.signaling_port,
        params.service_id.clone(),
        params.room_id.clone(),
    );

    let (transport_tx, transport_rx) = mpsc::channel(1024);

    let session = Session {
        name: params.name.clone(),
        peer_device_id: params.peer_device_id,
        auth_token: params.auth_token.clone(),
        room_id: params.room_id.clone(),
        transport_type: params.transport_type,
        transport_params: Some(TransportParams {
            streaming: params.client_params.clone(),
            min_port: params.min_port,
            max_port: params.max_port,
            use_nbp2p: true,
            p2p_username: params.p2p_username.clone(),
            p2p_password: params.p2p_password.clone(),
            reflex_servers: params.reflex_servers.clone(),
            relay_servers: params.relay_servers.clone(),
            ignored_nic: params.ignored_nic.clone(),
            event_tx: transport_tx,
        }),
        enable_mouse: params.enable_mouse,
        enable_keyboard: params.enable_keyboard,
        enable_gamepad: params.enable_gamepad,
        event_tx,
        pipe_server,
        pipe_client_fd: None,
        signaling,
        worker_process,
        transport: None,
        join_room_success: None,
        negotiated_params: None,
        create_fired: false,
        client_connected: false,
        transport_accepted: false,
        worker_registered_msg: HashSet::new(),
        last_recv_us: now_us(),
        time_sync: TimeSync::new(),
        rtt_us: 0,
        time_diff_us: 0,
        loss_rate: 0.0,
        closing: None,
        transport_disconnected: false,
        worker_stopped: false,
        stop_worker_sent: false,
        suppress_closed: false,
    };

    session
        .run(cmd_rx, pipe_rx, signaling_rx, worker_rx, transport_rx)
        .await;
}

struct Session {
    name: String,
    peer_device_id: i64,
    auth_token: String,
    room_id: String,
    transport_type: TransportType,
    /// Consumed when the transport is created.
    transport_params: Option<TransportParams>,
    enable_mouse: bool,
    enable_keyboard: bool,
    enable_gamepad: bool,
    event_tx: mpsc::Sender<SessionEvent>,
    pipe_server: Server,
    pipe_client_fd: Option<u32>,
    signaling: SignalingClient,
    worker_process: WorkerProcess,
    transport: Option<Transport>,
    join_room_success: Option<bool>,
    negotiated_params: Option<StreamingParams>,
    create_fired: bool,
    client_connected: bool,
    transport_accepted: bool,
    worker_registered_msg: HashSet<u32>,
    last_recv_us: i64,
    time_sync: TimeSync,
    rtt_us: i64,
    time_diff_us: i64,
    loss_rate: f32,
    closing: Option<CloseReason>,
    transport_disconnected: bool,
    worker_stopped: bool,
    stop_worker_sent: bool,
    /// Creation failed: the service erases the placeholder from the
    /// CreateCompleted error path, so no Closed report follows.
    suppress_closed: bool,
}

impl Session {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut pipe_rx: mpsc::Receiver<ServerEvent>,
        mut signaling_rx: mpsc::Receiver<SignalingEvent>,
        mut worker_rx: mpsc::Receiver<WorkerProcessEvent>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        info!(session = %self.name, room = %self.room_id, "Worker session enter main loop");

        let mut worker_keepalive = tokio::time::interval(WORKER_KEEPALIVE_INTERVAL);
        let mut time_sync_tick = tokio::time::interval(TIME_SYNC_INTERVAL);
        let mut stat_tick = tokio::time::interval(STAT_INTERVAL);
        let mut timeout_tick = tokio::time::interval(PEER_TIMEOUT);

        loop {
            tokio::select! {
                Some(event) = signaling_rx.recv() => self.on_signaling_event(event).await,
                Some(event) = pipe_rx.recv() => self.on_pipe_event(event).await,
                Some(event) = worker_rx.recv() => self.on_worker_event(event).await,
                Some(event) = transport_rx.recv() => self.on_transport_event(event).await,
                Some(cmd) = cmd_rx.recv() => self.on_command(cmd).await,
                _ = worker_keepalive.tick() => self.send_to_worker(&Message::KeepAlive),
                _ = time_sync_tick.tick() => self.sync_time(),
                _ = stat_tick.tick() => self.report_transport_stat(),
                _ = timeout_tick.tick() => self.check_peer_timeout().await,
                else => break,
            }
            if self.teardown_complete_check().await {
                break;
            }
        }
        info!(session = %self.name, "Worker session exit main loop");
    }

    // --- Creation ---

    async fn maybe_create_completed(&mut self) {
        if self.create_fired {
            return;
        }
        match self.join_room_success {
            None => return,
            Some(false) => {
                self.fire_create_completed(ErrorCode::ControlledInitFailed, None)
                    .await;
                self.shutdown_after_failed_create();
                return;
            }
            Some(true) => {}
        }
        let Some(negotiated) = self.negotiated_params.clone() else {
            return;
        };

        let Some(mut transport_params) = self.transport_params.take() else {
            return;
        };
        transport_params.streaming = negotiated.clone();
        match Transport::create(self.transport_type, transport_params).await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.fire_create_completed(ErrorCode::Success, Some(negotiated))
                    .await;
            }
            Err(e) => {
                warn!(session = %self.name, "Create transport failed: {e:#}");
                self.fire_create_completed(ErrorCode::ControlledInitFailed, None)
                    .await;
                self.shutdown_after_failed_create();
            }
        }
    }

    async fn fire_create_completed(
        &mut self,
        error_code: ErrorCode,
        params: Option<StreamingParams>,
    ) {
        if self.create_fired {
            return;
        }
        self.create_fired = true;
        let transport_type = self
            .transport
            .as_ref()
            .map(|t| t.kind())
            .unwrap_or(self.transport_type);
        let _ = self
            .event_tx
            .send(SessionEvent::CreateCompleted {
                error_code,
                transport_type,
                device_id: self.peer_device_id,
                name: self.name.clone(),
                params,
            })
            .await;
    }

    // --- Signaling ---

    async fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::JoinRoomResult(success) => {
                self.join_room_success = Some(success);
                self.maybe_create_completed().await;
            }
            SignalingEvent::Reconnecting => {
                self.join_room_success = None;
            }
            SignalingEvent::CoreClose => {
                self.on_closed(CloseReason::ClientClose).await;
            }
            SignalingEvent::RtcMessage { key, value } => match &self.transport {
                Some(transport) => transport.on_signaling_message(&key, &value),
                None => debug!(key, "Dropping rtc signaling before transport exists"),
            },
        }
    }

    // --- Worker pipe ---

    async fn on_pipe_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Accepted { conn_id } => {
                if self.pipe_client_fd.is_some() {
                    warn!(
                        conn_id,
                        "Another worker connected while one is being served"
                    );
                    self.pipe_server.close(conn_id);
                    return;
                }
                info!(conn_id, "Pipe server accepted worker");
                self.pipe_client_fd = Some(conn_id);
            }
            ServerEvent::Closed { conn_id } => {
                if self.pipe_client_fd == Some(conn_id) {
                    info!(conn_id, "Worker disconnected from pipe server");
                    self.pipe_client_fd = None;
                }
            }
            ServerEvent::Message { conn_id, packet } => {
                if self.pipe_client_fd != Some(conn_id) {
                    warn!(conn_id, "Pipe message from unexpected connection");
                    return;
                }
                self.on_worker_message(packet).await;
            }
        }
    }

    async fn on_worker_message(&mut self, packet: Packet) {
        match packet.msg_type {
            msg_type::START_WORKING_ACK => {
                let ack = match Message::decode(packet.msg_type, packet.body) {
                    Ok(Message::StartWorkingAck(ack)) => ack,
                    other => {
                        warn!("Bad StartWorkingAck from worker: {other:?}");
                        return;
                    }
                };
                if ack.err_code.is_success() {
                    self.worker_registered_msg.extend(ack.msg_types.iter());
                    self.send_to_peer(
                        &Message::StartTransmissionAck(StartTransmissionAck {
                            err_code: ErrorCode::Success,
                        }),
                        true,
                    );
                    let _ = self
                        .event_tx
                        .send(SessionEvent::AcceptedClient {
                            device_id: self.peer_device_id,
                        })
                        .await;
                    self.send_connection_status().await;
                } else {
                    warn!(err = ?ack.err_code, "Worker refused to start");
                    self.send_to_peer(
                        &Message::StartTransmissionAck(StartTransmissionAck {
                            err_code: ErrorCode::HostFailed,
                        }),
                        true,
                    );
                    self.on_closed(CloseReason::HostClose).await;
                }
            }
            msg_type::STREAMING_PARAMS => {
                match Message::decode(packet.msg_type, packet.body) {
                    Ok(Message::StreamingParams(p)) => {
                        info!(width = p.video_width, height = p.video_height,
                              codecs = ?p.video_codecs, "Worker negotiated streaming params");
                        self.negotiated_params = Some(p);
                        self.maybe_create_completed().await;
                    }
                    other => warn!("Bad StreamingParams from worker: {other:?}"),
                }
            }
            msg_type::VIDEO_FRAME => {
                if let Some(transport) = &self.transport {
                    match VideoFrame::deserialize(&packet.body) {
                        Ok(frame) => {
                            transport.send_video(frame);
                        }
                        Err(e) => warn!("Bad video frame from worker: {e}"),
                    }
                }
            }
            msg_type::AUDIO_DATA => {
                if let Some(transport) = &self.transport {
                    transport.send_audio(lanthing_proto::media::AudioData::deserialize(
                        &packet.body,
                    ));
                }
            }
            msg_type::CURSOR_INFO | msg_type::CLIPBOARD => {
                // Presentation updates go straight to the peer.
                self.send_raw_to_peer(packet, true);
            }
            other => {
                warn!(msg_type = other, "Unknown message from worker");
            }
        }
    }

    fn send_to_worker(&mut self, msg: &Message) {
        if let Some(fd) = self.pipe_client_fd {
            self.pipe_server.send(fd, msg);
        }
    }

    fn forward_to_worker(&mut self, packet: Packet) {
        if let Some(fd) = self.pipe_client_fd {
            self.pipe_server.send_packet(fd, packet);
        }
    }

    // --- Worker process ---

    async fn on_worker_event(&mut self, event: WorkerProcessEvent) {
        match event {
            WorkerProcessEvent::Failed(error_code) => {
                if !self.create_fired {
                    // Init failure: surface the precise code to the peer
                    // through the service's OpenConnectionAck.
                    self.fire_create_completed(error_code, None).await;
                    self.shutdown_after_failed_create();
                } else {
                    warn!(?error_code, "Worker failed mid-session");
                }
            }
            WorkerProcessEvent::Stopped => {
                self.worker_stopped = true;
                if self.closing.is_none() {
                    self.on_closed(CloseReason::HostClose).await;
                }
            }
        }
    }

    /// Creation failed before the session ever existed for the peer: stop
    /// the helpers; the service erases the placeholder without a Closed
    /// report.
    fn shutdown_after_failed_create(&mut self) {
        self.signaling.shutdown();
        self.pipe_server.shutdown();
        self.worker_process.stop();
        if let Some(transport) = &self.transport {
            transport.close();
        }
        self.suppress_closed = true;
        self.closing = Some(CloseReason::HostClose);
        self.transport_disconnected = true;
        self.worker_stopped = true;
    }

    // --- Transport ---

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Accepted => {
                info!(session = %self.name, "Accepted client");
                self.transport_accepted = true;
                self.update_last_recv_time();
            }
            TransportEvent::Disconnected => {
                self.transport_disconnected = true;
                if self.closing.is_none() {
                    self.on_closed(CloseReason::ClientClose).await;
                }
            }
            TransportEvent::Failed => {
                if self.closing.is_none() {
                    self.on_closed(CloseReason::TimeoutClose).await;
                }
            }
            TransportEvent::SignalingMessage { key, value } => {
                self.signaling.send_rtc(&key, &value);
            }
            TransportEvent::Data {
                msg_type, body, ..
            } => {
                self.dispatch_peer_message(msg_type, body).await;
            }
            TransportEvent::KeyframeRequest => {
                self.send_to_worker(&Message::RequestKeyframe);
            }
            TransportEvent::VideoBitrateUpdate(bitrate_bps) => {
                self.send_to_worker(&Message::ReconfigureVideoEncoder(
                    ReconfigureVideoEncoder { bitrate_bps },
                ));
            }
            TransportEvent::LossRateUpdate(rate) => {
                debug!(rate, "Loss rate update");
                self.loss_rate = rate;
            }
        }
    }

    async fn dispatch_peer_message(&mut self, msg_type_id: u32, body: bytes::Bytes) {
        self.update_last_recv_time();
        match msg_type_id {
            msg_type::KEEP_ALIVE => {
                // Presence only; no ack required.
            }
            msg_type::START_TRANSMISSION => {
                self.on_start_transmission(body).await;
            }
            msg_type::TIME_SYNC => {
                if let Ok(Message::TimeSync(ts)) = Message::decode(msg_type_id, body) {
                    if let Some(result) = self.time_sync.calc(ts.t0, ts.t1, ts.t2, now_us()) {
                        self.rtt_us = result.rtt;
                        self.time_diff_us = result.time_diff;
                        debug!(rtt = self.rtt_us, diff = self.time_diff_us, "Time sync");
                    }
                } else {
                    warn!("Bad TimeSync from peer");
                }
            }
            msg_type::REQUEST_KEYFRAME => {
                // The TCP variant delivers keyframe requests in-band.
                self.send_to_worker(&Message::RequestKeyframe);
            }
            msg_type::CLIPBOARD => {
                if let Ok(Message::Clipboard(clip)) =
                    Message::decode(msg_type_id, body.clone())
                {
                    let _ = self
                        .event_tx
                        .send(SessionEvent::RemoteClipboard(clip))
                        .await;
                }
                if self.worker_registered_msg.contains(&msg_type_id) {
                    self.forward_to_worker(Packet::new(msg_type_id, body));
                }
            }
            other if self.worker_registered_msg.contains(&other) => {
                if self.input_allowed(other) {
                    self.forward_to_worker(Packet::new(other, body));
                }
            }
            other => {
                debug!(msg_type = other, "Unhandled peer message");
            }
        }
    }

    fn input_allowed(&self, msg_type_id: u32) -> bool {
        match msg_type_id {
            msg_type::MOUSE_EVENT | msg_type::WHEEL_EVENT => self.enable_mouse,
            msg_type::KEYBOARD_EVENT => self.enable_keyboard,
            msg_type::GAMEPAD_EVENT => self.enable_gamepad,
            _ => true,
        }
    }

    async fn on_start_transmission(&mut self, body: bytes::Bytes) {
        if self.client_connected {
            // Duplicate handshake from the same client; just re-ack.
            self.send_to_peer(
                &Message::StartTransmissionAck(StartTransmissionAck {
                    err_code: ErrorCode::Success,
                }),
                true,
            );
            return;
        }
        let msg = match Message::decode(msg_type::START_TRANSMISSION, body) {
            Ok(Message::StartTransmission(m)) => m,
            other => {
                warn!("Bad StartTransmission: {other:?}");
                return;
            }
        };
        if msg.token != self.auth_token {
            warn!("StartTransmission with invalid token");
            self.send_to_peer(
                &Message::StartTransmissionAck(StartTransmissionAck {
                    err_code: ErrorCode::AuthFailed,
                }),
                true,
            );
            return;
        }
        self.client_connected = true;
        // The ack waits for StartWorkingAck from the worker.
        self.send_to_worker(&Message::StartWorking);
    }

    fn send_to_peer(&self, msg: &Message, reliable: bool) -> bool {
        match &self.transport {
            Some(transport) => transport.send_message(msg, reliable),
            None => false,
        }
    }

    fn send_raw_to_peer(&self, packet: Packet, reliable: bool) {
        let msg = Message::Unknown {
            msg_type: packet.msg_type,
            body: packet.body,
        };
        self.send_to_peer(&msg, reliable);
    }

    // --- Commands from the service ---

    async fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Operate(operations) => {
                let mut status_dirty = false;
                for op in operations {
                    match op {
                        Operation::EnableMouse => {
                            self.enable_mouse = true;
                            status_dirty = true;
                        }
                        Operation::DisableMouse => {
                            self.enable_mouse = false;
                            status_dirty = true;
                        }
                        Operation::EnableKeyboard => {
                            self.enable_keyboard = true;
                            status_dirty = true;
                        }
                        Operation::DisableKeyboard => {
                            self.enable_keyboard = false;
                            status_dirty = true;
                        }
                        Operation::EnableGamepad => {
                            self.enable_gamepad = true;
                            status_dirty = true;
                        }
                        Operation::DisableGamepad => {
                            self.enable_gamepad = false;
                            status_dirty = true;
                        }
                        Operation::EnableAudio | Operation::DisableAudio => {
                            // Audio policy lives in the worker.
                            let enable = op == Operation::EnableAudio;
                            debug!(enable, "Audio toggle forwarded to worker");
                        }
                        Operation::Kick => {
                            self.on_closed(CloseReason::UserKick).await;
                            return;
                        }
                    }
                }
                if status_dirty {
                    self.send_connection_status().await;
                }
            }
            SessionCommand::AppClipboard(clipboard) => {
                self.send_to_peer(&Message::Clipboard(clipboard), true);
            }
        }
    }

    async fn send_connection_status(&mut self) {
        let _ = self
            .event_tx
            .send(SessionEvent::ConnectionStatus(ConnectionStatus {
                device_id: self.peer_device_id,
                rtt_us: self.rtt_us,
                loss_rate: self.loss_rate,
                enable_mouse: self.enable_mouse,
                enable_keyboard: self.enable_keyboard,
                enable_gamepad: self.enable_gamepad,
            }))
            .await;
    }

    // --- Periodic tasks ---

    fn sync_time(&mut self) {
        if !self.transport_accepted || self.closing.is_some() {
            return;
        }
        let msg = TimeSyncMsg {
            t0: self.time_sync.t0(),
            t1: self.time_sync.t1(),
            t2: now_us(),
        };
        self.send_to_peer(&Message::TimeSync(msg), true);
    }

    fn report_transport_stat(&mut self) {
        if !self.transport_accepted || self.closing.is_some() {
            return;
        }
        let Some(transport) = &self.transport else {
            return;
        };
        let (bwe, nack) = transport.stats();
        self.send_to_peer(
            &Message::SendSideStat(SendSideStat {
                bwe,
                nack,
                loss_rate: self.loss_rate,
            }),
            true,
        );
    }

    async fn check_peer_timeout(&mut self) {
        if !self.transport_accepted || self.closing.is_some() {
            return;
        }
        let elapsed_us = now_us() - self.last_recv_us;
        if elapsed_us > PEER_TIMEOUT.as_micros() as i64 {
            warn!(session = %self.name, elapsed_us, "No peer data, closing");
            self.on_closed(CloseReason::TimeoutClose).await;
        }
    }

    fn update_last_recv_time(&mut self) {
        self.last_recv_us = now_us();
    }

    // --- Teardown ---

    async fn on_closed(&mut self, reason: CloseReason) {
        if self.closing.is_some() {
            return;
        }
        if !self.create_fired {
            // Terminal before creation resolved: the peer learns about it
            // through the OpenConnectionAck error, not a close report.
            self.fire_create_completed(ErrorCode::ControlledInitFailed, None)
                .await;
            self.shutdown_after_failed_create();
            return;
        }
        info!(session = %self.name, ?reason, "Worker session closing");
        self.closing = Some(reason);

        match &self.transport {
            Some(transport) if !self.transport_disconnected => transport.close(),
            _ => self.transport_disconnected = true,
        }

        if !self.worker_stopped && !self.stop_worker_sent {
            self.stop_worker_sent = true;
            if self.pipe_client_fd.is_some() {
                self.send_to_worker(&Message::StopWorking);
            }
            // The supervisor terminates the child if StopWorking is ignored
            // (or never arrived).
            let worker = self.worker_process.clone();
            tokio::spawn(async move {
                tokio::time::sleep(STOP_WORKER_GRACE).await;
                worker.stop();
            });
        }
    }

    /// True when the single Closed notification went out and the task must
    /// end.
    async fn teardown_complete_check(&mut self) -> bool {
        let Some(reason) = self.closing else {
            return false;
        };
        if !self.transport_disconnected || !self.worker_stopped {
            return false;
        }
        self.signaling.shutdown();
        self.pipe_server.shutdown();
        if !self.suppress_closed {
            let _ = self
                .event_tx
                .send(SessionEvent::Closed {
                    device_id: self.peer_device_id,
                    reason,
                    name: self.name.clone(),
                    room_id: self.room_id.clone(),
                })
                .await;
        }
        true
    }
}
