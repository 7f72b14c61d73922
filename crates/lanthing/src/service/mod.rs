//! Host-side service dispatcher.
//!
//! Owns the long-lived TLS link to the rendezvous server, the local app
//! pipe, persisted settings, and at most one worker session. Everything runs
//! on one task; sessions report back through a channel and are destroyed
//! from here, never from their own callbacks.

pub mod session;
pub mod worker_process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lanthing_proto::messages::{
    AcceptedConnection, CloseConnection, CloseConnectionReason, ConfirmConnection, ConfirmResult,
    DisconnectedConnection, LoginDevice, Message, OpenConnection, OpenConnectionAck, Operation,
    OsType, ServiceStatus, TransportType,
};
use lanthing_proto::{ErrorCode, REQUIRED_PEER_VERSION, combine_version};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::net::{Client, ClientEvent, ClientParams, Endpoint, Server, ServerEvent, tls};
use crate::settings::{HistoryIds, Settings};
use crate::util::{random_access_token, random_session_name};

use session::{CloseReason, SessionEvent, SessionHandle, SessionParams, WorkerSession};
use worker_process::{DefaultLauncher, WorkerLauncher};

pub const APP_PIPE_NAME: &str = "lanthing_service_manager";

const SERVER_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const APP_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Consecutive app-absent checks before a run-as-service instance exits.
const APP_ABSENT_LIMIT: u32 = 2;

pub struct ServiceParams {
    pub config: ServiceConfig,
    pub settings_path: PathBuf,
    pub history_path: PathBuf,
    pub app_pipe_name: String,
    pub worker_program: PathBuf,
    pub launcher: Arc<dyn WorkerLauncher>,
}

impl ServiceParams {
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        let data_dir = PathBuf::from(&config.service.data_dir);
        let worker_program = match &config.service.worker_path {
            Some(path) => PathBuf::from(path),
            None => std::env::current_exe().context("Cannot resolve own image path")?,
        };
        Ok(Self {
            settings_path: data_dir.join("settings.json"),
            history_path: data_dir.join("historyids"),
            app_pipe_name: APP_PIPE_NAME.to_string(),
            worker_program,
            launcher: Arc::new(DefaultLauncher),
            config,
        })
    }
}

/// Run the service until a terminal condition (today: the run-as-service
/// watchdog deciding nobody is attended).
pub async fn run(params: ServiceParams) -> Result<()> {
    let mut settings = Settings::load(params.settings_path.clone())?;
    let history = HistoryIds::load(params.history_path.clone());

    let device_id = settings.get_integer("device_id").unwrap_or(0);
    let access_token = match settings.get_string("access_token") {
        Some(token) if !token.is_empty() => token,
        _ => {
            let token = random_access_token();
            settings.set_string("access_token", &token)?;
            token
        }
    };

    let tls_params = if params.config.server.use_tls {
        let pinned = match &params.config.server.cert {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("Failed to read pinned cert {path}"))?,
            ),
            None => None,
        };
        Some(tls::TlsParams::new(pinned.as_deref())?)
    } else {
        None
    };

    let (server_client, server_rx) = Client::connect(ClientParams {
        tls: tls_params,
        ..ClientParams::new(Endpoint::Tcp {
            host: params.config.server.host.clone(),
            port: params.config.server.port,
        })
    });

    let (app_server, app_rx) = Server::bind(Endpoint::Pipe {
        name: params.app_pipe_name.clone(),
    })
    .await
    .context("Bind app pipe failed")?;

    let (session_event_tx, session_event_rx) = mpsc::channel(256);

    let service = Service {
        settings,
        history,
        device_id,
        access_token,
        server: server_client,
        app: app_server,
        app_conn: None,
        server_logged: false,
        sessions: HashMap::new(),
        pending: None,
        session_event_tx,
        app_absent_checks: 0,
        run_as_service: params.config.service.run_as_service,
        worker_program: params.worker_program,
        launcher: params.launcher,
    };

    service.run(server_rx, app_rx, session_event_rx).await
}

/// A validated OpenConnection waiting for user confirmation (or being
/// turned into a session right away on a cookie hit).
struct PendingConnection {
    session_name: String,
    msg: Box<OpenConnection>,
}

struct Service {
    settings: Settings,
    history: HistoryIds,
    device_id: i64,
    access_token: String,
    server: Client,
    app: Server,
    app_conn: Option<u32>,
    server_logged: bool,
    /// At most one entry. `None` marks the admission placeholder before the
    /// session task exists.
    sessions: HashMap<String, Option<SessionHandle>>,
    pending: Option<PendingConnection>,
    session_event_tx: mpsc::Sender<SessionEvent>,
    app_absent_checks: u32,
    run_as_service: bool,
    worker_program: PathBuf,
    launcher: Arc<dyn WorkerLauncher>,
}

impl Service {
    async fn run(
        mut self,
        mut server_rx: mpsc::Receiver<ClientEvent>,
        mut app_rx: mpsc::Receiver<ServerEvent>,
        mut session_rx: mpsc::Receiver<SessionEvent>,
    ) -> Result<()> {
        info!("Lanthing service enter main loop");
        let mut keepalive = tokio::time::interval(SERVER_KEEPALIVE_INTERVAL);
        let mut app_check = tokio::time::interval(APP_CHECK_INTERVAL);

        loop {
            tokio::select! {
                Some(event) = server_rx.recv() => self.on_server_event(event),
                Some(event) = app_rx.recv() => self.on_app_event(event),
                Some(event) = session_rx.recv() => self.on_session_event(event),
                _ = keepalive.tick() => {
                    self.server.send(&Message::KeepAlive);
                }
                _ = app_check.tick() => {
                    if self.check_run_as_service() {
                        info!("No app attached, service exiting");
                        return Ok(());
                    }
                }
                else => return Ok(()),
            }
        }
    }

    // --- Rendezvous server link ---

    fn on_server_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => {
                info!("Connected to server");
                if self.device_id != 0 {
                    self.login_device();
                } else {
                    self.server.send(&Message::AllocateDeviceId);
                }
            }
            ClientEvent::Disconnected => {
                warn!("Disconnected from server");
                self.server_logged = false;
                self.send_to_app(&Message::ServiceStatus(ServiceStatus {
                    status: ErrorCode::ServiceStatusDisconnectedFromServer,
                }));
            }
            ClientEvent::Reconnecting => {
                info!("Reconnecting to server...");
                self.server_logged = false;
            }
            ClientEvent::Message(packet) => {
                match Message::decode(packet.msg_type, packet.body) {
                    Ok(Message::KeepAliveAck) => {}
                    Ok(Message::LoginDeviceAck(ack)) => {
                        info!(err = ?ack.err_code, "LoginDeviceAck");
                        if ack.err_code.is_success() {
                            self.server_logged = true;
                            self.send_to_app(&Message::ServiceStatus(ServiceStatus {
                                status: ErrorCode::Success,
                            }));
                        }
                    }
                    Ok(Message::AllocateDeviceIdAck(ack)) => {
                        info!(device_id = ack.device_id, "Allocated device id");
                        self.device_id = ack.device_id;
                        if let Err(e) = self.settings.set_integer("device_id", ack.device_id) {
                            warn!("Persist device_id failed: {e:#}");
                        }
                        self.login_device();
                    }
                    Ok(Message::OpenConnection(msg)) => {
                        self.on_open_connection(msg);
                    }
                    Ok(other) => {
                        warn!(msg_type = other.msg_type(), "Unknown message from server");
                    }
                    Err(e) => warn!("Bad message from server: {e}"),
                }
            }
        }
    }

    fn login_device(&mut self) {
        let (major, minor, patch) = version_components();
        self.server.send(&Message::LoginDevice(LoginDevice {
            device_id: self.device_id,
            version_major: major,
            version_minor: minor,
            version_patch: patch,
            allow_control: self.settings.get_boolean("allow_control").unwrap_or(false),
            cookie: self.settings.get_string("device_cookie").unwrap_or_default(),
            os_type: OsType::current(),
        }));
    }

    // --- Admission control ---

    fn on_open_connection(&mut self, msg: Box<OpenConnection>) {
        info!(client = msg.client_device_id, "Received OpenConnection");

        let my_version = {
            let (major, minor, patch) = version_components();
            combine_version(major, minor, patch)
        };
        if msg.client_version < REQUIRED_PEER_VERSION {
            warn!("Client version too low");
            self.refuse_connection(ErrorCode::ClientVersionTooLow, msg.transport_type);
            return;
        }
        if my_version < msg.required_version {
            warn!("Host version too low");
            self.refuse_connection(ErrorCode::HostVersionTooLow, msg.transport_type);
            return;
        }
        if msg.client_device_id <= 0 {
            warn!(device_id = msg.client_device_id, "Invalid device id");
            self.refuse_connection(ErrorCode::InvalidParameter, msg.transport_type);
            return;
        }
        if !self.sessions.is_empty() {
            warn!("Serving another client");
            self.refuse_connection(ErrorCode::ServingAnotherClient, msg.transport_type);
            return;
        }
        if msg.access_token != self.access_token {
            warn!("OpenConnection with invalid access token");
            self.refuse_connection(ErrorCode::AccessCodeInvalid, msg.transport_type);
            return;
        }
        let valid_params = msg.streaming_params.as_ref().is_some_and(|p| {
            !p.video_codecs.is_empty()
                && p.video_width > 0
                && p.video_height > 0
        });
        if !valid_params {
            warn!("OpenConnection without valid streaming params");
            self.refuse_connection(ErrorCode::InvalidParameter, msg.transport_type);
            return;
        }

        // Reserve the one-session slot before anything asynchronous.
        let session_name = random_session_name();
        self.sessions.insert(session_name.clone(), None);

        let pending = PendingConnection {
            session_name,
            msg,
        };

        // Cookie hit lets a previously approved peer skip the prompt.
        let cookie_name = format!("from_{}", pending.msg.client_device_id);
        let stored = self.settings.get_string(&cookie_name);
        if stored.as_deref() == Some(pending.msg.cookie.as_str()) && !pending.msg.cookie.is_empty()
        {
            // Refresh the stored cookie's update time.
            if let Err(e) = self.settings.set_string(&cookie_name, &pending.msg.cookie) {
                warn!("Persist cookie failed: {e:#}");
            }
            self.create_session(pending);
            return;
        }

        if self.app_conn.is_none() {
            warn!("App not online, can't confirm connection");
            self.sessions.remove(&pending.session_name);
            self.refuse_connection(ErrorCode::AppNotOnline, pending.msg.transport_type);
            return;
        }
        self.send_to_app(&Message::ConfirmConnection(ConfirmConnection {
            device_id: pending.msg.client_device_id,
        }));
        self.pending = Some(pending);
    }

    fn refuse_connection(&mut self, err_code: ErrorCode, transport_type: TransportType) {
        self.server.send(&Message::OpenConnectionAck(OpenConnectionAck {
            err_code,
            transport_type,
            streaming_params: None,
        }));
    }

    fn create_session(&mut self, pending: PendingConnection) {
        let msg = pending.msg;
        let id_str = msg.client_device_id.to_string();

        let host_enable_tcp = self.settings.get_boolean("enable_tcp").unwrap_or(false);
        let client_enable_tcp = msg.transport_type == TransportType::Tcp;
        let transport_type = if msg.transport_type == TransportType::ForceRtc {
            TransportType::Rtc
        } else if host_enable_tcp || client_enable_tcp {
            TransportType::Tcp
        } else {
            TransportType::Rtc
        };

        let user_relay = self.settings.get_string("relay").unwrap_or_default();
        let relay_servers = if user_relay.is_empty() {
            msg.relay_servers.clone()
        } else {
            vec![user_relay]
        };

        let Some(client_params) = msg.streaming_params.clone() else {
            return; // checked at admission
        };

        let params = SessionParams {
            name: pending.session_name.clone(),
            peer_device_id: msg.client_device_id,
            auth_token: msg.auth_token.clone(),
            service_id: msg.service_id.clone(),
            room_id: msg.room_id.clone(),
            signaling_addr: msg.signaling_addr.clone(),
            signaling_port: msg.signaling_port,
            p2p_username: msg.p2p_username.clone(),
            p2p_password: msg.p2p_password.clone(),
            reflex_servers: msg.reflex_servers.clone(),
            relay_servers,
            transport_type,
            client_params,
            enable_mouse: self
                .settings
                .get_boolean(&format!("enable_mouse_for_{id_str}"))
                .unwrap_or(false),
            enable_keyboard: self
                .settings
                .get_boolean(&format!("enable_keyboard_for_{id_str}"))
                .unwrap_or(false),
            enable_gamepad: self
                .settings
                .get_boolean(&format!("enable_gamepad_for_{id_str}"))
                .unwrap_or(true),
            min_port: self.settings.get_integer("min_port").unwrap_or(0) as u16,
            max_port: self.settings.get_integer("max_port").unwrap_or(0) as u16,
            ignored_nic: self.settings.get_string("ignored_nic").unwrap_or_default(),
            monitor_index: 0,
            worker_program: self.worker_program.clone(),
            launcher: Arc::clone(&self.launcher),
            event_tx: self.session_event_tx.clone(),
        };

        let handle = WorkerSession::spawn(params);
        info!(session = %pending.session_name, "Worker session spawned");
        self.sessions
            .insert(pending.session_name, Some(handle));
    }

    // --- Session events ---

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::CreateCompleted {
                error_code,
                transport_type,
                device_id,
                name,
                params,
            } => {
                if error_code.is_success() {
                    self.server.send(&Message::OpenConnectionAck(OpenConnectionAck {
                        err_code: ErrorCode::Success,
                        transport_type,
                        streaming_params: params,
                    }));
                } else {
                    self.server.send(&Message::OpenConnectionAck(OpenConnectionAck {
                        err_code: error_code,
                        transport_type,
                        streaming_params: None,
                    }));
                    self.sessions.remove(&name);
                    self.send_to_app(&Message::DisconnectedConnection(
                        DisconnectedConnection { device_id },
                    ));
                }
            }
            SessionEvent::Closed {
                device_id,
                reason,
                name,
                room_id,
            } => {
                self.report_session_closed(reason, &room_id);
                self.sessions.remove(&name);
                self.send_to_app(&Message::DisconnectedConnection(DisconnectedConnection {
                    device_id,
                }));
                self.maybe_refresh_access_token();
            }
            SessionEvent::AcceptedClient { device_id } => {
                if let Err(e) = self.history.insert_newest(&device_id.to_string()) {
                    warn!("Persist history ids failed: {e:#}");
                }
                self.send_to_app(&Message::AcceptedConnection(AcceptedConnection {
                    device_id,
                }));
            }
            SessionEvent::ConnectionStatus(status) => {
                self.send_to_app(&Message::ConnectionStatus(status));
            }
            SessionEvent::RemoteClipboard(clipboard) => {
                self.send_to_app(&Message::Clipboard(clipboard));
            }
        }
    }

    fn report_session_closed(&mut self, reason: CloseReason, room_id: &str) {
        self.server.send(&Message::CloseConnection(CloseConnection {
            reason: collapse_close_reason(reason),
            room_id: room_id.to_string(),
        }));
    }

    fn maybe_refresh_access_token(&mut self) {
        if !self.settings.get_boolean("auto_refresh").unwrap_or(false) {
            return;
        }
        self.access_token = random_access_token();
        if let Err(e) = self.settings.set_string("access_token", &self.access_token) {
            warn!("Persist refreshed access token failed: {e:#}");
        }
        info!("Access token refreshed");
    }

    // --- App pipe ---

    fn on_app_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Accepted { conn_id } => {
                if self.app_conn.is_some() {
                    warn!(conn_id, "Second app connection refused");
                    self.app.close(conn_id);
                    return;
                }
                info!(conn_id, "App connected");
                self.app_conn = Some(conn_id);
                self.app_absent_checks = 0;
                let status = if self.server_logged {
                    ErrorCode::Success
                } else {
                    ErrorCode::ServiceStatusDisconnectedFromServer
                };
                self.send_to_app(&Message::ServiceStatus(ServiceStatus { status }));
            }
            ServerEvent::Closed { conn_id } => {
                if self.app_conn == Some(conn_id) {
                    info!("App disconnected");
                    self.app_conn = None;
                }
            }
            ServerEvent::Message { conn_id, packet } => {
                if self.app_conn != Some(conn_id) {
                    return;
                }
                match Message::decode(packet.msg_type, packet.body) {
                    Ok(Message::ConfirmConnectionAck(ack)) => {
                        self.on_confirm_connection_ack(ack.result);
                    }
                    Ok(Message::OperateConnection(op)) => {
                        self.on_operate_connection(op.operations);
                    }
                    Ok(Message::Clipboard(clipboard)) => {
                        if let Some(handle) = self.single_session() {
                            handle.app_clipboard(clipboard);
                        }
                    }
                    Ok(other) => {
                        warn!(msg_type = other.msg_type(), "Unknown message from app");
                    }
                    Err(e) => warn!("Bad message from app: {e}"),
                }
            }
        }
    }

    fn on_confirm_connection_ack(&mut self, result: ConfirmResult) {
        let Some(pending) = self.pending.take() else {
            warn!("ConfirmConnectionAck without a pending connection");
            self.server.send(&Message::OpenConnectionAck(OpenConnectionAck {
                err_code: ErrorCode::Unknown,
                transport_type: TransportType::Rtc,
                streaming_params: None,
            }));
            return;
        };
        match result {
            ConfirmResult::Agree => self.create_session(pending),
            ConfirmResult::AgreeNextTime => {
                let cookie_name = format!("from_{}", pending.msg.client_device_id);
                if let Err(e) = self.settings.set_string(&cookie_name, &pending.msg.cookie) {
                    warn!("Persist cookie failed: {e:#}");
                }
                self.create_session(pending);
            }
            ConfirmResult::Reject => {
                info!("User rejected the connection");
                self.sessions.remove(&pending.session_name);
                self.refuse_connection(ErrorCode::UserReject, pending.msg.transport_type);
            }
        }
    }

    fn on_operate_connection(&mut self, operations: Vec<Operation>) {
        let Some(id) = self.single_session().map(|h| h.peer_device_id) else {
            warn!("No available connection, can't operate");
            return;
        };
        // Persist device toggles so the next session from this peer starts
        // with the same policy.
        for op in &operations {
            let (key, value) = match op {
                Operation::EnableMouse => (format!("enable_mouse_for_{id}"), true),
                Operation::DisableMouse => (format!("enable_mouse_for_{id}"), false),
                Operation::EnableKeyboard => (format!("enable_keyboard_for_{id}"), true),
                Operation::DisableKeyboard => (format!("enable_keyboard_for_{id}"), false),
                Operation::EnableGamepad => (format!("enable_gamepad_for_{id}"), true),
                Operation::DisableGamepad => (format!("enable_gamepad_for_{id}"), false),
                _ => continue,
            };
            if let Err(e) = self.settings.set_boolean(&key, value) {
                warn!("Persist device toggle failed: {e:#}");
            }
        }
        if let Some(handle) = self.single_session() {
            handle.operate(operations);
        }
    }

    fn single_session(&self) -> Option<&SessionHandle> {
        if self.sessions.len() != 1 {
            return None;
        }
        self.sessions.values().next().and_then(|s| s.as_ref())
    }

    fn send_to_app(&self, msg: &Message) {
        if let Some(conn_id) = self.app_conn {
            self.app.send(conn_id, msg);
        }
    }

    /// Returns true when the service should exit: installed as a system
    /// service, nobody attended for two consecutive checks, and the daemon
    /// setting doesn't keep it alive.
    fn check_run_as_service(&mut self) -> bool {
        if !self.run_as_service {
            return false;
        }
        if self.app_conn.is_some() {
            self.app_absent_checks = 0;
            return false;
        }
        self.app_absent_checks += 1;
        if self.app_absent_checks < APP_ABSENT_LIMIT {
            return false;
        }
        !self.settings.get_boolean("daemon").unwrap_or(false)
    }
}

/// The server only distinguishes who hung up; several local reasons
/// collapse into ClientClose on the wire.
fn collapse_close_reason(reason: CloseReason) -> CloseConnectionReason {
    match reason {
        CloseReason::ClientClose => CloseConnectionReason::ClientClose,
        CloseReason::HostClose => CloseConnectionReason::HostClose,
        CloseReason::TimeoutClose => CloseConnectionReason::ClientClose,
        CloseReason::UserKick => CloseConnectionReason::ClientClose,
    }
}

fn version_components() -> (i32, i32, i32) {
    let mut parts = env!("CARGO_PKG_VERSION")
        .split('.')
        .map(|p| p.parse::<i32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanthing_proto::messages::{
        ConfirmConnectionAck, StreamingParams, VideoCodecType, msg_type,
    };
    use lanthing_proto::messages::{AllocateDeviceIdAck, LoginDeviceAck};
    use lanthing_proto::frame::Packet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    #[test]
    fn timeout_and_kick_report_as_client_close() {
        assert_eq!(
            collapse_close_reason(CloseReason::TimeoutClose),
            CloseConnectionReason::ClientClose
        );
        assert_eq!(
            collapse_close_reason(CloseReason::UserKick),
            CloseConnectionReason::ClientClose
        );
        assert_eq!(
            collapse_close_reason(CloseReason::ClientClose),
            CloseConnectionReason::ClientClose
        );
        assert_eq!(
            collapse_close_reason(CloseReason::HostClose),
            CloseConnectionReason::HostClose
        );
    }

    struct CountingLauncher {
        spawned: AtomicUsize,
    }

    impl WorkerLauncher for CountingLauncher {
        fn spawn(
            &self,
            _spec: &worker_process::WorkerLaunchSpec,
            _args: &[String],
        ) -> std::io::Result<tokio::process::Child> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            tokio::process::Command::new("/bin/sh")
                .arg("-c")
                .arg("sleep 100")
                .spawn()
        }
    }

    struct Fixture {
        rendezvous: Server,
        rendezvous_rx: mpsc::Receiver<ServerEvent>,
        rendezvous_conn: u32,
        app: Client,
        app_rx: mpsc::Receiver<ClientEvent>,
        settings_path: PathBuf,
        launcher: Arc<CountingLauncher>,
    }

    async fn wait_rendezvous_msg(
        rx: &mut mpsc::Receiver<ServerEvent>,
        want: u32,
    ) -> (u32, Packet) {
        loop {
            match timeout(WAIT, rx.recv()).await.expect("timed out").expect("closed") {
                ServerEvent::Message { conn_id, packet } if packet.msg_type == want => {
                    return (conn_id, packet);
                }
                _ => continue,
            }
        }
    }

    async fn wait_app_msg(rx: &mut mpsc::Receiver<ClientEvent>, want: u32) -> Packet {
        loop {
            match timeout(WAIT, rx.recv()).await.expect("timed out").expect("closed") {
                ClientEvent::Message(pkt) if pkt.msg_type == want => return pkt,
                _ => continue,
            }
        }
    }

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lanthing-service-test-{}-{tag}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Boot the service against a fake rendezvous server + fake app, with
    /// the settings file seeded by `seed`.
    async fn start_service(tag: &str, seed: impl FnOnce(&mut Settings)) -> Fixture {
        let dir = test_dir(tag);
        let settings_path = dir.join("settings.json");
        {
            let mut settings = Settings::load(settings_path.clone()).unwrap();
            settings.set_string("access_token", "ABC123").unwrap();
            settings.set_integer("device_id", 99).unwrap();
            seed(&mut settings);
        }

        let (rendezvous, mut rendezvous_rx) = Server::bind(Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .await
        .unwrap();

        let launcher = Arc::new(CountingLauncher {
            spawned: AtomicUsize::new(0),
        });
        let app_pipe_name = format!("lanthing-svc-test-{}-{tag}", std::process::id());
        let config: crate::config::ServiceConfig = toml::from_str(&format!(
            r#"
            [server]
            host = "127.0.0.1"
            port = {}
            use_tls = false
            "#,
            rendezvous.local_port()
        ))
        .unwrap();
        let params = ServiceParams {
            config,
            settings_path: settings_path.clone(),
            history_path: dir.join("historyids"),
            app_pipe_name: app_pipe_name.clone(),
            worker_program: PathBuf::from("/proc/self/exe"),
            launcher: Arc::clone(&launcher),
        };
        tokio::spawn(async move {
            let _ = run(params).await;
        });

        // Rendezvous side: login handshake.
        let (rendezvous_conn, _login) =
            wait_rendezvous_msg(&mut rendezvous_rx, msg_type::LOGIN_DEVICE).await;
        rendezvous.send(
            rendezvous_conn,
            &Message::LoginDeviceAck(LoginDeviceAck {
                err_code: ErrorCode::Success,
            }),
        );

        // App side: connect and observe service-ready.
        let (app, mut app_rx) = Client::connect(ClientParams {
            initial_backoff: Duration::from_millis(50),
            ..ClientParams::new(Endpoint::Pipe {
                name: app_pipe_name,
            })
        });
        wait_app_msg(&mut app_rx, msg_type::SERVICE_STATUS).await;

        Fixture {
            rendezvous,
            rendezvous_rx,
            rendezvous_conn,
            app,
            app_rx,
            settings_path,
            launcher,
        }
    }

    fn open_connection(device_id: i64, token: &str, cookie: &str) -> Message {
        Message::OpenConnection(Box::new(OpenConnection {
            client_device_id: device_id,
            client_version: REQUIRED_PEER_VERSION,
            required_version: 0,
            access_token: token.to_string(),
            cookie: cookie.to_string(),
            transport_type: TransportType::Tcp,
            streaming_params: Some(StreamingParams {
                video_codecs: vec![VideoCodecType::H264_420],
                video_width: 1920,
                video_height: 1080,
                screen_refresh_rate: 60,
                audio_channels: 2,
                audio_sample_rate: 48000,
            }),
            signaling_addr: "127.0.0.1".to_string(),
            signaling_port: 1,
            auth_token: "authtok".to_string(),
            room_id: "room-1".to_string(),
            p2p_username: String::new(),
            p2p_password: String::new(),
            reflex_servers: vec![],
            relay_servers: vec![],
            service_id: "svc-1".to_string(),
        }))
    }

    async fn expect_ack(fx: &mut Fixture) -> OpenConnectionAck {
        let (_, pkt) =
            wait_rendezvous_msg(&mut fx.rendezvous_rx, msg_type::OPEN_CONNECTION_ACK).await;
        match Message::decode(pkt.msg_type, pkt.body).unwrap() {
            Message::OpenConnectionAck(ack) => ack,
            other => panic!("expected OpenConnectionAck, got {other:?}"),
        }
    }

    async fn wait_for_spawn(launcher: &CountingLauncher, count: usize) {
        let deadline = std::time::Instant::now() + WAIT;
        while launcher.spawned.load(Ordering::SeqCst) < count {
            assert!(std::time::Instant::now() < deadline, "worker never spawned");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn unknown_cookie_asks_the_app_and_agree_next_time_persists_it() {
        let mut fx = start_service("s1", |_| {}).await;

        fx.rendezvous
            .send(fx.rendezvous_conn, &open_connection(42, "ABC123", "c1"));

        // The app is asked to confirm.
        let pkt = wait_app_msg(&mut fx.app_rx, msg_type::CONFIRM_CONNECTION).await;
        let Message::ConfirmConnection(confirm) =
            Message::decode(pkt.msg_type, pkt.body).unwrap()
        else {
            panic!("expected ConfirmConnection");
        };
        assert_eq!(confirm.device_id, 42);

        fx.app
            .send(&Message::ConfirmConnectionAck(ConfirmConnectionAck {
                result: ConfirmResult::AgreeNextTime,
            }));

        // The worker launches and the cookie is persisted for next time.
        wait_for_spawn(&fx.launcher, 1).await;
        let settings = Settings::load(fx.settings_path.clone()).unwrap();
        assert_eq!(settings.get_string("from_42").as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn invalid_access_token_is_refused_without_a_session() {
        let mut fx = start_service("s2", |settings| {
            settings.set_string("access_token", "ZZZ999").unwrap();
        })
        .await;

        fx.rendezvous
            .send(fx.rendezvous_conn, &open_connection(42, "ABC123", "c1"));

        let ack = expect_ack(&mut fx).await;
        assert_eq!(ack.err_code, ErrorCode::AccessCodeInvalid);
        assert_eq!(fx.launcher.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn matching_cookie_skips_confirmation_and_second_client_is_refused() {
        let mut fx = start_service("s3", |settings| {
            settings.set_string("from_42", "c1").unwrap();
        })
        .await;

        fx.rendezvous
            .send(fx.rendezvous_conn, &open_connection(42, "ABC123", "c1"));
        wait_for_spawn(&fx.launcher, 1).await;

        // Back-to-back second request while the first session exists.
        fx.rendezvous
            .send(fx.rendezvous_conn, &open_connection(43, "ABC123", "c2"));
        let ack = expect_ack(&mut fx).await;
        assert_eq!(ack.err_code, ErrorCode::ServingAnotherClient);
        assert_eq!(fx.launcher.spawned.load(Ordering::SeqCst), 1);

        // The app was never asked for either request.
        assert!(
            timeout(Duration::from_millis(300), async {
                loop {
                    if let Some(ClientEvent::Message(pkt)) = fx.app_rx.recv().await {
                        if pkt.msg_type == msg_type::CONFIRM_CONNECTION {
                            return;
                        }
                    }
                }
            })
            .await
            .is_err()
        );
    }

    #[tokio::test]
    async fn user_reject_refuses_and_clears_the_placeholder() {
        let mut fx = start_service("reject", |_| {}).await;

        fx.rendezvous
            .send(fx.rendezvous_conn, &open_connection(42, "ABC123", "c1"));
        wait_app_msg(&mut fx.app_rx, msg_type::CONFIRM_CONNECTION).await;
        fx.app
            .send(&Message::ConfirmConnectionAck(ConfirmConnectionAck {
                result: ConfirmResult::Reject,
            }));

        let ack = expect_ack(&mut fx).await;
        assert_eq!(ack.err_code, ErrorCode::UserReject);
        assert_eq!(fx.launcher.spawned.load(Ordering::SeqCst), 0);

        // The placeholder is gone: a new request is admitted again.
        fx.rendezvous
            .send(fx.rendezvous_conn, &open_connection(42, "ABC123", "c1"));
        wait_app_msg(&mut fx.app_rx, msg_type::CONFIRM_CONNECTION).await;
    }

    #[tokio::test]
    async fn no_app_means_app_not_online() {
        let mut fx = start_service("noapp", |_| {}).await;
        // Detach the app before the request arrives.
        fx.app.shutdown();
        loop {
            match timeout(WAIT, fx.app_rx.recv()).await.expect("timed out") {
                Some(ClientEvent::Disconnected) | None => break,
                Some(_) => continue,
            }
        }
        // Give the service a beat to observe the pipe close.
        tokio::time::sleep(Duration::from_millis(200)).await;

        fx.rendezvous
            .send(fx.rendezvous_conn, &open_connection(42, "ABC123", "c1"));
        let ack = expect_ack(&mut fx).await;
        assert_eq!(ack.err_code, ErrorCode::AppNotOnline);
        assert_eq!(fx.launcher.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn first_login_allocates_and_persists_a_device_id() {
        let dir = test_dir("alloc");
        let settings_path = dir.join("settings.json");
        {
            let mut settings = Settings::load(settings_path.clone()).unwrap();
            settings.set_string("access_token", "ABC123").unwrap();
            // No device_id: first start.
        }

        let (rendezvous, mut rendezvous_rx) = Server::bind(Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .await
        .unwrap();
        let config: crate::config::ServiceConfig = toml::from_str(&format!(
            "[server]\nhost = \"127.0.0.1\"\nport = {}\nuse_tls = false\n",
            rendezvous.local_port()
        ))
        .unwrap();
        let params = ServiceParams {
            config,
            settings_path: settings_path.clone(),
            history_path: dir.join("historyids"),
            app_pipe_name: format!("lanthing-svc-test-{}-alloc", std::process::id()),
            worker_program: PathBuf::from("/proc/self/exe"),
            launcher: Arc::new(CountingLauncher {
                spawned: AtomicUsize::new(0),
            }),
        };
        tokio::spawn(async move {
            let _ = run(params).await;
        });

        let (conn, _) =
            wait_rendezvous_msg(&mut rendezvous_rx, msg_type::ALLOCATE_DEVICE_ID).await;
        rendezvous.send(
            conn,
            &Message::AllocateDeviceIdAck(AllocateDeviceIdAck { device_id: 777 }),
        );

        let (_, pkt) = wait_rendezvous_msg(&mut rendezvous_rx, msg_type::LOGIN_DEVICE).await;
        let Message::LoginDevice(login) = Message::decode(pkt.msg_type, pkt.body).unwrap()
        else {
            panic!("expected LoginDevice");
        };
        assert_eq!(login.device_id, 777);

        // Persisted for the next start.
        let deadline = std::time::Instant::now() + WAIT;
        loop {
            let settings = Settings::load(settings_path.clone()).unwrap();
            if settings.get_integer("device_id") == Some(777) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "device_id never persisted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
