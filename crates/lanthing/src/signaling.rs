//! Signaling client.
//!
//! Joins a room on the signaling server (plain TCP) and relays two levels of
//! messages: Core (in-band control, today just `close`) and Rtc (opaque
//! key/value pairs owned by the transport). Reconnects follow the stream
//! client's backoff; while reconnecting the room-join outcome is unknown
//! again until the next ack.

use lanthing_proto::messages::{
    JoinRoom, Message, SignalingLevel, SignalingMessage,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::net::{Client, ClientEvent, ClientParams, Endpoint};

/// Core-level key announcing the peer is gone.
pub const CORE_KEY_CLOSE: &str = "close";

#[derive(Debug, PartialEq)]
pub enum SignalingEvent {
    JoinRoomResult(bool),
    /// Core-level `close`: the session must tear down as ClientClose.
    CoreClose,
    /// Rtc-level payload for `Transport::on_signaling_message`.
    RtcMessage { key: String, value: String },
    /// Connection lost; join status is unknown until re-acked.
    Reconnecting,
}

pub struct SignalingClient {
    client: Client,
}

impl SignalingClient {
    pub fn connect(
        host: String,
        port: u16,
        session_id: String,
        room_id: String,
    ) -> (SignalingClient, mpsc::Receiver<SignalingEvent>) {
        let (client, client_rx) = Client::connect(ClientParams::new(Endpoint::Tcp {
            host,
            port,
        }));
        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(signaling_task(
            client.clone(),
            client_rx,
            event_tx,
            session_id,
            room_id,
        ));
        (SignalingClient { client }, event_rx)
    }

    /// Relay an opaque transport message to the peer.
    pub fn send_rtc(&self, key: &str, value: &str) -> bool {
        self.client.send(&Message::SignalingMessage(SignalingMessage {
            level: SignalingLevel::Rtc,
            key: key.to_string(),
            value: value.to_string(),
        }))
    }

    pub fn shutdown(&self) {
        self.client.shutdown();
    }
}

async fn signaling_task(
    client: Client,
    mut client_rx: mpsc::Receiver<ClientEvent>,
    event_tx: mpsc::Sender<SignalingEvent>,
    session_id: String,
    room_id: String,
) {
    while let Some(event) = client_rx.recv().await {
        match event {
            ClientEvent::Connected => {
                info!(%room_id, "Connected to signaling server, joining room");
                client.send(&Message::JoinRoom(JoinRoom {
                    session_id: session_id.clone(),
                    room_id: room_id.clone(),
                }));
            }
            ClientEvent::Disconnected => {
                info!("Disconnected from signaling server");
            }
            ClientEvent::Reconnecting => {
                info!("Reconnecting to signaling server...");
                if event_tx.send(SignalingEvent::Reconnecting).await.is_err() {
                    return;
                }
            }
            ClientEvent::Message(packet) => {
                let msg = match Message::decode(packet.msg_type, packet.body) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Bad signaling payload: {e}");
                        continue;
                    }
                };
                let forward = match msg {
                    Message::JoinRoomAck(ack) => {
                        if !ack.err_code.is_success() {
                            warn!(%room_id, err = ?ack.err_code, "Join signaling room failed");
                        }
                        Some(SignalingEvent::JoinRoomResult(ack.err_code.is_success()))
                    }
                    Message::SignalingMessage(sig) => match sig.level {
                        SignalingLevel::Core => {
                            debug!(key = %sig.key, "Signaling core message");
                            if sig.key == CORE_KEY_CLOSE {
                                Some(SignalingEvent::CoreClose)
                            } else {
                                None
                            }
                        }
                        SignalingLevel::Rtc => Some(SignalingEvent::RtcMessage {
                            key: sig.key,
                            value: sig.value,
                        }),
                    },
                    Message::SignalingMessageAck(ack) => {
                        if !ack.err_code.is_success() {
                            warn!(err = ?ack.err_code, "Send signaling message failed");
                        }
                        None
                    }
                    other => {
                        warn!(msg_type = other.msg_type(), "Unknown signaling message");
                        None
                    }
                };
                if let Some(event) = forward
                    && event_tx.send(event).await.is_err()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Server, ServerEvent};
    use lanthing_proto::ErrorCode;
    use lanthing_proto::messages::{JoinRoomAck, SignalingMessageAck, msg_type};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv_event(rx: &mut mpsc::Receiver<SignalingEvent>) -> SignalingEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    async fn recv_server(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn joins_room_and_relays_levels() {
        let (server, mut server_rx) = Server::bind(Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .await
        .unwrap();

        let (client, mut events) = SignalingClient::connect(
            "127.0.0.1".to_string(),
            server.local_port(),
            "svc-1".to_string(),
            "room-1".to_string(),
        );

        let ServerEvent::Accepted { conn_id } = recv_server(&mut server_rx).await else {
            panic!("expected Accepted");
        };

        // JoinRoom arrives with the right ids.
        let ServerEvent::Message { packet, .. } = recv_server(&mut server_rx).await else {
            panic!("expected JoinRoom");
        };
        assert_eq!(packet.msg_type, msg_type::JOIN_ROOM);
        let Message::JoinRoom(join) = Message::decode(packet.msg_type, packet.body).unwrap()
        else {
            panic!("expected JoinRoom payload");
        };
        assert_eq!(join.session_id, "svc-1");
        assert_eq!(join.room_id, "room-1");

        server.send(
            conn_id,
            &Message::JoinRoomAck(JoinRoomAck {
                err_code: ErrorCode::Success,
            }),
        );
        assert_eq!(recv_event(&mut events).await, SignalingEvent::JoinRoomResult(true));

        // Rtc level is relayed opaquely.
        server.send(
            conn_id,
            &Message::SignalingMessage(SignalingMessage {
                level: SignalingLevel::Rtc,
                key: "answer".into(),
                value: "sdp".into(),
            }),
        );
        assert_eq!(
            recv_event(&mut events).await,
            SignalingEvent::RtcMessage {
                key: "answer".into(),
                value: "sdp".into()
            }
        );

        // A failed message ack is logged, not forwarded; core close is.
        server.send(
            conn_id,
            &Message::SignalingMessageAck(SignalingMessageAck {
                err_code: ErrorCode::Unknown,
            }),
        );
        server.send(
            conn_id,
            &Message::SignalingMessage(SignalingMessage {
                level: SignalingLevel::Core,
                key: CORE_KEY_CLOSE.into(),
                value: String::new(),
            }),
        );
        assert_eq!(recv_event(&mut events).await, SignalingEvent::CoreClose);

        // Outgoing Rtc messages reach the server.
        assert!(client.send_rtc("candidate", "c=1"));
        let ServerEvent::Message { packet, .. } = recv_server(&mut server_rx).await else {
            panic!("expected SignalingMessage");
        };
        assert_eq!(packet.msg_type, msg_type::SIGNALING_MESSAGE);
    }

    #[tokio::test]
    async fn join_failure_is_reported() {
        let (server, mut server_rx) = Server::bind(Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        })
        .await
        .unwrap();

        let (_client, mut events) = SignalingClient::connect(
            "127.0.0.1".to_string(),
            server.local_port(),
            "svc-1".to_string(),
            "room-404".to_string(),
        );

        let ServerEvent::Accepted { conn_id } = recv_server(&mut server_rx).await else {
            panic!("expected Accepted");
        };
        let _join = recv_server(&mut server_rx).await;
        server.send(
            conn_id,
            &Message::JoinRoomAck(JoinRoomAck {
                err_code: ErrorCode::Unknown,
            }),
        );
        assert_eq!(
            recv_event(&mut events).await,
            SignalingEvent::JoinRoomResult(false)
        );
    }
}
