//! Framed stream endpoints.
//!
//! Two kinds of endpoint share one contract: TCP (DNS-resolved, optional TLS
//! overlay) and local "pipes" (Unix domain sockets named like the original
//! Windows pipes, living under `$XDG_RUNTIME_DIR`). Clients auto-reconnect
//! with capped exponential backoff; servers accept many connections and hand
//! each a monotonically increasing `conn_id`.
//!
//! Each endpoint runs as its own task; the owner talks to it through a typed
//! mailbox and consumes an event stream. A send after the task is gone fails
//! at the call site (closed channel) instead of crossing into a dead loop.

pub mod tls;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use lanthing_proto::frame::{Packet, Parser};
use lanthing_proto::messages::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

const MAILBOX_DEPTH: usize = 1024;
const READ_BUF_SIZE: usize = 64 * 1024;

/// Where a stream endpoint lives.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Pipe { name: String },
}

/// Pipe names map to Unix sockets under the user runtime dir.
pub fn pipe_path(name: &str) -> PathBuf {
    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    dir.join(name)
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

type BoxedStream = Box<dyn Stream>;

// --- Client ---

#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    /// An established connection dropped.
    Disconnected,
    /// About to retry; buffered parser state has been discarded.
    Reconnecting,
    Message(Packet),
}

pub struct ClientParams {
    pub endpoint: Endpoint,
    /// TLS overlay for TCP endpoints; `None` = plaintext.
    pub tls: Option<tls::TlsParams>,
    /// Reconnect forever (with backoff) instead of giving up after the
    /// first terminal error.
    pub reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ClientParams {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            tls: None,
            reconnect: true,
            initial_backoff: DEFAULT_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

enum ClientCmd {
    Send(Vec<u8>),
    Shutdown,
}

/// Handle to a framed client task. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    cmd_tx: mpsc::Sender<ClientCmd>,
}

impl Client {
    pub fn connect(params: ClientParams) -> (Client, mpsc::Receiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(MAILBOX_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(MAILBOX_DEPTH);
        tokio::spawn(client_task(params, cmd_rx, event_tx));
        (Client { cmd_tx }, event_rx)
    }

    /// Queue a message for the wire. Returns false when the client is gone
    /// or its mailbox is full (the caller may retry after backpressure).
    pub fn send(&self, msg: &Message) -> bool {
        let packet = match msg.to_packet() {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode message: {e}");
                return false;
            }
        };
        self.send_packet(packet)
    }

    pub fn send_packet(&self, packet: Packet) -> bool {
        match self.cmd_tx.try_send(ClientCmd::Send(packet.serialize())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Client mailbox full, dropping outgoing message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(ClientCmd::Shutdown);
    }
}

async fn open_stream(params: &ClientParams) -> Result<BoxedStream> {
    match &params.endpoint {
        Endpoint::Tcp { host, port } => {
            let tcp = TcpStream::connect((host.as_str(), *port))
                .await
                .with_context(|| format!("Connect to {host}:{port} failed"))?;
            tcp.set_nodelay(true).ok();
            match &params.tls {
                Some(tls_params) => {
                    let stream = tls::connect(tcp, host, tls_params).await?;
                    Ok(Box::new(stream))
                }
                None => Ok(Box::new(tcp)),
            }
        }
        Endpoint::Pipe { name } => {
            let path = pipe_path(name);
            let stream = UnixStream::connect(&path)
                .await
                .with_context(|| format!("Connect to pipe {} failed", path.display()))?;
            Ok(Box::new(stream))
        }
    }
}

async fn client_task(
    params: ClientParams,
    mut cmd_rx: mpsc::Receiver<ClientCmd>,
    event_tx: mpsc::Sender<ClientEvent>,
) {
    let mut backoff = params.initial_backoff;
    let mut first_attempt = true;
    loop {
        if !first_attempt {
            if event_tx.send(ClientEvent::Reconnecting).await.is_err() {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(params.max_backoff);
        }
        first_attempt = false;

        // Sends queued while the link was down are stale; drop them the way
        // a connected-check would have failed them.
        loop {
            match cmd_rx.try_recv() {
                Ok(ClientCmd::Send(_)) => continue,
                Ok(ClientCmd::Shutdown) => return,
                Err(_) => break,
            }
        }

        let stream = match open_stream(&params).await {
            Ok(s) => s,
            Err(e) => {
                debug!("Connect failed: {e:#}");
                if !params.reconnect {
                    let _ = event_tx.send(ClientEvent::Disconnected).await;
                    return;
                }
                continue;
            }
        };

        backoff = params.initial_backoff;
        if event_tx.send(ClientEvent::Connected).await.is_err() {
            return;
        }

        match run_client_stream(stream, &mut cmd_rx, &event_tx).await {
            StreamEnd::Shutdown => {
                let _ = event_tx.send(ClientEvent::Disconnected).await;
                return;
            }
            StreamEnd::Closed => {
                if event_tx.send(ClientEvent::Disconnected).await.is_err() {
                    return;
                }
                if !params.reconnect {
                    return;
                }
            }
        }
    }
}

enum StreamEnd {
    /// Peer closed or the stream errored.
    Closed,
    /// Owner asked us to stop.
    Shutdown,
}

async fn run_client_stream(
    mut stream: BoxedStream,
    cmd_rx: &mut mpsc::Receiver<ClientCmd>,
    event_tx: &mpsc::Sender<ClientEvent>,
) -> StreamEnd {
    // Parser is per-connection: a reconnect starts from clean state.
    let mut parser = Parser::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => return StreamEnd::Closed,
                Ok(n) => {
                    parser.push(&buf[..n]);
                    loop {
                        match parser.next() {
                            Ok(Some(packet)) => {
                                if event_tx.send(ClientEvent::Message(packet)).await.is_err() {
                                    return StreamEnd::Shutdown;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Corrupt stream: {e}");
                                return StreamEnd::Closed;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("Read error: {e}");
                    return StreamEnd::Closed;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCmd::Send(bytes)) => {
                    if stream.write_all(&bytes).await.is_err() {
                        return StreamEnd::Closed;
                    }
                }
                Some(ClientCmd::Shutdown) | None => return StreamEnd::Shutdown,
            },
        }
    }
}

// --- Server ---

#[derive(Debug)]
pub enum ServerEvent {
    Accepted { conn_id: u32 },
    /// Always delivered after `Accepted` for the same id.
    Closed { conn_id: u32 },
    Message { conn_id: u32, packet: Packet },
}

enum ServerCmd {
    Send { conn_id: u32, bytes: Vec<u8> },
    Close { conn_id: u32 },
    Shutdown,
}

enum AnyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl AnyListener {
    async fn accept(&self) -> std::io::Result<BoxedStream> {
        match self {
            AnyListener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
            AnyListener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Handle to a framed server task.
#[derive(Clone)]
pub struct Server {
    cmd_tx: mpsc::Sender<ServerCmd>,
    local_port: u16,
}

impl Server {
    /// Bind and start accepting. Pipe endpoints replace any stale socket
    /// file left by a previous run.
    pub async fn bind(endpoint: Endpoint) -> Result<(Server, mpsc::Receiver<ServerEvent>)> {
        let (listener, local_port) = match &endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .with_context(|| format!("Bind {host}:{port} failed"))?;
                let port = listener.local_addr()?.port();
                (AnyListener::Tcp(listener), port)
            }
            Endpoint::Pipe { name } => {
                let path = pipe_path(name);
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)
                    .with_context(|| format!("Bind pipe {} failed", path.display()))?;
                (AnyListener::Unix(listener), 0)
            }
        };
        Ok(Self::start(listener, local_port))
    }

    /// Bind a TCP listener on the first free port inside `[min, max]`
    /// (ephemeral when the range is unset).
    pub async fn bind_tcp_in_range(
        min_port: u16,
        max_port: u16,
    ) -> Result<(Server, mpsc::Receiver<ServerEvent>)> {
        if min_port == 0 && max_port == 0 {
            return Self::bind(Endpoint::Tcp {
                host: "0.0.0.0".to_string(),
                port: 0,
            })
            .await;
        }
        let upper = max_port.max(min_port);
        for port in min_port..=upper {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    let port = listener.local_addr()?.port();
                    return Ok(Self::start(AnyListener::Tcp(listener), port));
                }
                Err(e) => debug!(port, "Port busy: {e}"),
            }
        }
        anyhow::bail!("No free port in {min_port}..={upper}")
    }

    fn start(listener: AnyListener, local_port: u16) -> (Server, mpsc::Receiver<ServerEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(MAILBOX_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(MAILBOX_DEPTH);
        tokio::spawn(server_task(listener, cmd_rx, event_tx));
        (Server { cmd_tx, local_port }, event_rx)
    }

    /// Bound TCP port (0 for pipes).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn send(&self, conn_id: u32, msg: &Message) -> bool {
        let packet = match msg.to_packet() {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode message: {e}");
                return false;
            }
        };
        self.send_packet(conn_id, packet)
    }

    /// Forward a packet verbatim (used for registered pass-through types).
    pub fn send_packet(&self, conn_id: u32, packet: Packet) -> bool {
        match self.cmd_tx.try_send(ServerCmd::Send {
            conn_id,
            bytes: packet.serialize(),
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id, "Server mailbox full, dropping outgoing message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn close(&self, conn_id: u32) {
        let _ = self.cmd_tx.try_send(ServerCmd::Close { conn_id });
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(ServerCmd::Shutdown);
    }
}

async fn server_task(
    listener: AnyListener,
    mut cmd_rx: mpsc::Receiver<ServerCmd>,
    event_tx: mpsc::Sender<ServerEvent>,
) {
    let mut next_conn_id: u32 = 1;
    let mut writers: HashMap<u32, mpsc::Sender<ConnCmd>> = HashMap::new();
    // Connection tasks report their end here so the writer map stays clean.
    let (done_tx, mut done_rx) = mpsc::channel::<u32>(MAILBOX_DEPTH);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let conn_id = next_conn_id;
                    next_conn_id += 1;
                    if event_tx.send(ServerEvent::Accepted { conn_id }).await.is_err() {
                        return;
                    }
                    let (conn_tx, conn_rx) = mpsc::channel(MAILBOX_DEPTH);
                    writers.insert(conn_id, conn_tx);
                    tokio::spawn(server_conn_task(
                        conn_id,
                        stream,
                        conn_rx,
                        event_tx.clone(),
                        done_tx.clone(),
                    ));
                    debug!(conn_id, "Accepted connection");
                }
                Err(e) => {
                    warn!("Accept failed: {e}");
                    return;
                }
            },
            Some(conn_id) = done_rx.recv() => {
                writers.remove(&conn_id);
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(ServerCmd::Send { conn_id, bytes }) => {
                    if let Some(tx) = writers.get(&conn_id)
                        && tx.try_send(ConnCmd::Write(bytes)).is_err()
                    {
                        debug!(conn_id, "Dropping write to closing connection");
                    }
                }
                Some(ServerCmd::Close { conn_id }) => {
                    if let Some(tx) = writers.remove(&conn_id) {
                        let _ = tx.try_send(ConnCmd::Close);
                    }
                }
                Some(ServerCmd::Shutdown) | None => return,
            },
        }
    }
}

enum ConnCmd {
    Write(Vec<u8>),
    Close,
}

async fn server_conn_task(
    conn_id: u32,
    mut stream: BoxedStream,
    mut conn_rx: mpsc::Receiver<ConnCmd>,
    event_tx: mpsc::Sender<ServerEvent>,
    done_tx: mpsc::Sender<u32>,
) {
    let mut parser = Parser::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    'conn: loop {
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => break 'conn,
                Ok(n) => {
                    parser.push(&buf[..n]);
                    loop {
                        match parser.next() {
                            Ok(Some(packet)) => {
                                if event_tx
                                    .send(ServerEvent::Message { conn_id, packet })
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(conn_id, "Corrupt stream, closing connection: {e}");
                                break 'conn;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(conn_id, "Read error: {e}");
                    break 'conn;
                }
            },
            cmd = conn_rx.recv() => match cmd {
                Some(ConnCmd::Write(bytes)) => {
                    if stream.write_all(&bytes).await.is_err() {
                        break 'conn;
                    }
                }
                Some(ConnCmd::Close) | None => break 'conn,
            },
        }
    }
    let _ = done_tx.send(conn_id).await;
    let _ = event_tx.send(ServerEvent::Closed { conn_id }).await;
    info!(conn_id, "Connection closed");
}
