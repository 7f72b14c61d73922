//! TCP transport variant.
//!
//! A framed listener bound inside the configured port range. The bound port
//! is advertised to the peer through signaling (`tcp_listen`); the first
//! connection wins and later ones are refused. Everything rides the reliable
//! stream, so keyframe requests arrive as ordinary control messages and the
//! bandwidth "estimate" is a constant.

use anyhow::Result;
use lanthing_proto::messages::Message;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{TransportEvent, TransportParams};
use crate::net::{Server, ServerEvent};

/// Constant estimate reported for TCP, where no estimator runs.
pub const TCP_BWE_BPS: u32 = 100_000_000;

/// Signaling key carrying the listener port to the peer.
pub const SIG_KEY_TCP_LISTEN: &str = "tcp_listen";

enum TcpCmd {
    Send(Message),
    Close,
}

pub struct TcpTransport {
    cmd_tx: mpsc::Sender<TcpCmd>,
    local_port: u16,
}

impl TcpTransport {
    pub async fn bind(params: TransportParams) -> Result<TcpTransport> {
        let (server, server_rx) =
            Server::bind_tcp_in_range(params.min_port, params.max_port).await?;
        let local_port = server.local_port();
        info!(port = local_port, "TCP transport listening");

        params
            .event_tx
            .send(TransportEvent::SignalingMessage {
                key: SIG_KEY_TCP_LISTEN.to_string(),
                value: local_port.to_string(),
            })
            .await
            .ok();

        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        tokio::spawn(tcp_task(server, server_rx, cmd_rx, params.event_tx));
        Ok(TcpTransport { cmd_tx, local_port })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn send_message(&self, msg: &Message, _reliable: bool) -> bool {
        self.cmd_tx.try_send(TcpCmd::Send(msg.clone())).is_ok()
    }

    pub fn on_signaling_message(&self, key: &str, value: &str) {
        // Nothing to negotiate on plain TCP.
        debug!(key, value, "Ignoring signaling message on TCP transport");
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(TcpCmd::Close);
    }
}

async fn tcp_task(
    server: Server,
    mut server_rx: mpsc::Receiver<ServerEvent>,
    mut cmd_rx: mpsc::Receiver<TcpCmd>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let mut peer: Option<u32> = None;
    let mut closing = false;
    let mut cmd_done = false;
    loop {
        tokio::select! {
            event = server_rx.recv() => match event {
                Some(ServerEvent::Accepted { conn_id }) => {
                    if peer.is_some() {
                        warn!(conn_id, "Second client on TCP transport, refusing");
                        server.close(conn_id);
                        continue;
                    }
                    peer = Some(conn_id);
                    info!(conn_id, "TCP transport accepted client");
                    if event_tx.send(TransportEvent::Accepted).await.is_err() {
                        return;
                    }
                }
                Some(ServerEvent::Closed { conn_id }) => {
                    if peer == Some(conn_id) {
                        let _ = event_tx.send(TransportEvent::Disconnected).await;
                        return;
                    }
                }
                Some(ServerEvent::Message { conn_id, packet }) => {
                    if peer != Some(conn_id) {
                        continue;
                    }
                    if event_tx
                        .send(TransportEvent::Data {
                            msg_type: packet.msg_type,
                            body: packet.body,
                            reliable: true,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                None => {
                    if !closing {
                        let _ = event_tx.send(TransportEvent::Failed).await;
                    }
                    return;
                }
            },
            cmd = cmd_rx.recv(), if !cmd_done => {
                match cmd {
                    Some(TcpCmd::Send(msg)) => {
                        if let Some(conn_id) = peer {
                            server.send(conn_id, &msg);
                        }
                        continue;
                    }
                    Some(TcpCmd::Close) => {}
                    None => cmd_done = true,
                }
                if closing {
                    continue;
                }
                closing = true;
                match peer {
                    Some(conn_id) => {
                        // Wait for the Closed event so Disconnected is
                        // emitted exactly once, after the socket is gone.
                        server.close(conn_id);
                    }
                    None => {
                        server.shutdown();
                        let _ = event_tx.send(TransportEvent::Disconnected).await;
                        return;
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Client, ClientEvent, ClientParams, Endpoint};
    use crate::transport::{Transport, TransportParams};
    use lanthing_proto::messages::{
        StartTransmission, StreamingParams, TransportType, VideoCodecType, msg_type,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    fn params(event_tx: mpsc::Sender<TransportEvent>) -> TransportParams {
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
            use_nbp2p: false,
            p2p_username: String::new(),
            p2p_password: String::new(),
            reflex_servers: vec![],
            relay_servers: vec![],
            ignored_nic: String::new(),
            event_tx,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    fn connect_peer(port: u16) -> (Client, mpsc::Receiver<ClientEvent>) {
        Client::connect(ClientParams {
            reconnect: false,
            ..ClientParams::new(Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            })
        })
    }

    #[tokio::test]
    async fn advertises_port_accepts_one_peer_and_moves_data() {
        let (event_tx, mut events) = mpsc::channel(64);
        let transport = Transport::create(TransportType::Tcp, params(event_tx))
            .await
            .unwrap();
        assert_eq!(transport.kind(), TransportType::Tcp);

        // First event: the advertised listen port.
        let TransportEvent::SignalingMessage { key, value } = recv(&mut events).await else {
            panic!("expected SignalingMessage");
        };
        assert_eq!(key, SIG_KEY_TCP_LISTEN);
        let port: u16 = value.parse().unwrap();

        let (peer, mut peer_rx) = connect_peer(port);
        assert!(matches!(recv(&mut events).await, TransportEvent::Accepted));
        assert!(matches!(
            timeout(Duration::from_secs(5), peer_rx.recv()).await.unwrap(),
            Some(ClientEvent::Connected)
        ));

        // Peer -> host control data.
        peer.send(&Message::StartTransmission(StartTransmission {
            token: "ABC123".into(),
        }));
        let TransportEvent::Data {
            msg_type: tag,
            reliable,
            ..
        } = recv(&mut events).await
        else {
            panic!("expected Data");
        };
        assert_eq!(tag, msg_type::START_TRANSMISSION);
        assert!(reliable);

        // Host -> peer.
        assert!(transport.send_message(&Message::KeepAlive, true));
        loop {
            match timeout(Duration::from_secs(5), peer_rx.recv()).await.unwrap() {
                Some(ClientEvent::Message(pkt)) => {
                    assert_eq!(pkt.msg_type, msg_type::KEEP_ALIVE);
                    break;
                }
                Some(_) => continue,
                None => panic!("peer channel closed"),
            }
        }

        // TCP has a constant estimate and no NACK counter.
        assert_eq!(transport.stats(), (TCP_BWE_BPS, 0));
    }

    #[tokio::test]
    async fn second_client_is_refused() {
        let (event_tx, mut events) = mpsc::channel(64);
        let transport = Transport::create(TransportType::Tcp, params(event_tx))
            .await
            .unwrap();
        let TransportEvent::SignalingMessage { value, .. } = recv(&mut events).await else {
            panic!("expected SignalingMessage");
        };
        let port: u16 = value.parse().unwrap();

        let (_first, mut first_rx) = connect_peer(port);
        assert!(matches!(recv(&mut events).await, TransportEvent::Accepted));
        assert!(matches!(
            timeout(Duration::from_secs(5), first_rx.recv()).await.unwrap(),
            Some(ClientEvent::Connected)
        ));

        let (_second, mut second_rx) = connect_peer(port);
        // The second connection is dropped by the host without an Accepted
        // event reaching the session.
        loop {
            match timeout(Duration::from_secs(5), second_rx.recv()).await.unwrap() {
                Some(ClientEvent::Connected) => continue,
                Some(ClientEvent::Disconnected) | None => break,
                Some(other) => panic!("unexpected event {other:?}"),
            }
        }
        drop(transport);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_emits_single_disconnect() {
        let (event_tx, mut events) = mpsc::channel(64);
        let transport = Transport::create(TransportType::Tcp, params(event_tx))
            .await
            .unwrap();
        let TransportEvent::SignalingMessage { value, .. } = recv(&mut events).await else {
            panic!("expected SignalingMessage");
        };
        let port: u16 = value.parse().unwrap();

        let (_peer, _peer_rx) = connect_peer(port);
        assert!(matches!(recv(&mut events).await, TransportEvent::Accepted));

        transport.close();
        transport.close();
        assert!(matches!(recv(&mut events).await, TransportEvent::Disconnected));
        // Nothing after Disconnected.
        match timeout(Duration::from_millis(200), events.recv()).await {
            Ok(None) | Err(_) => {}
            Ok(Some(event)) => panic!("unexpected event after Disconnected: {event:?}"),
        }
    }

    #[tokio::test]
    async fn peer_drop_emits_disconnect() {
        let (event_tx, mut events) = mpsc::channel(64);
        let transport = Transport::create(TransportType::Tcp, params(event_tx))
            .await
            .unwrap();
        let TransportEvent::SignalingMessage { value, .. } = recv(&mut events).await else {
            panic!("expected SignalingMessage");
        };
        let port: u16 = value.parse().unwrap();

        let (peer, _peer_rx) = connect_peer(port);
        assert!(matches!(recv(&mut events).await, TransportEvent::Accepted));
        peer.shutdown();
        assert!(matches!(recv(&mut events).await, TransportEvent::Disconnected));
        drop(transport);
    }
}
