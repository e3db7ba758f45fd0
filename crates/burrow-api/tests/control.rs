//! End-to-end tests of the `/ws` control endpoint with a WebSocket agent

use burrow_api::{ApiServer, ApiServerConfig, Heartbeat};
use burrow_lib::{
    Broker, BrokerConfig, ControlHandshake, ControlPacket, CreateTunnelRequest, PacketType,
    ProvisionRequest, TunnelInfo,
};
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct Relay {
    broker: Arc<Broker>,
    api_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn relay(start: u16, end: u16) -> Relay {
    relay_with_heartbeat(start, end, Heartbeat::default()).await
}

async fn relay_with_heartbeat(start: u16, end: u16, heartbeat: Heartbeat) -> Relay {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let broker = Arc::new(Broker::new(
        BrokerConfig::default()
            .with_port_range(start, end)
            .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: api_addr,
            jwt_secret: b"control-test-secret".to_vec(),
            heartbeat,
            ..Default::default()
        },
        broker.clone(),
    );
    tokio::spawn(server.serve(listener, shutdown.clone()));

    Relay {
        broker,
        api_addr,
        shutdown,
    }
}

impl Relay {
    async fn agent(&self, handshake: &ControlHandshake) -> AgentSocket {
        let url = format!("ws://{}/ws", self.api_addr);
        let (mut socket, _) = connect_async(url).await.unwrap();
        socket
            .send(Message::Text(serde_json::to_string(handshake).unwrap()))
            .await
            .unwrap();
        socket
    }

    async fn wait_for_tunnels(&self, count: usize) {
        timeout(WAIT, async {
            while self.broker.tunnel_count().await != count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("tunnel count never reached expected value");
    }
}

fn handshake(info: &TunnelInfo) -> ControlHandshake {
    ControlHandshake {
        user: info.user.clone(),
        token: info.token.clone(),
    }
}

/// Next CREATE_TUNNEL packet, skipping control frames
async fn next_create_tunnel(socket: &mut AgentSocket) -> CreateTunnelRequest {
    timeout(WAIT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let packet: ControlPacket<CreateTunnelRequest> =
                        serde_json::from_str(&text).unwrap();
                    assert_eq!(packet.packet_type, PacketType::CreateTunnel);
                    return packet.data.unwrap();
                }
                Some(Ok(_)) => continue,
                other => panic!("control socket ended: {:?}", other),
            }
        }
    })
    .await
    .expect("no CREATE_TUNNEL packet")
}

#[tokio::test]
async fn test_agent_relays_public_connection() {
    let relay = relay(52000, 52199).await;
    let info = relay
        .broker
        .provision("alice", ProvisionRequest::tcp(), false)
        .unwrap();

    let mut agent = relay.agent(&handshake(&info)).await;
    relay.wait_for_tunnels(1).await;

    let mut client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
    let request = next_create_tunnel(&mut agent).await;
    assert_eq!(request.address, "127.0.0.1");
    assert!((52000..=52199).contains(&request.port));

    let mut leg = TcpStream::connect(("127.0.0.1", request.port)).await.unwrap();

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, leg.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping");

    leg.write_all(b"pong").await.unwrap();
    timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn test_bad_handshake_is_closed_going_away() {
    let relay = relay(52200, 52399).await;
    let info = relay
        .broker
        .provision("alice", ProvisionRequest::tcp(), false)
        .unwrap();

    let mut agent = relay
        .agent(&ControlHandshake {
            user: "mallory".to_string(),
            token: info.token.clone(),
        })
        .await;

    let frame = timeout(WAIT, async {
        loop {
            match agent.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("expected a close frame, got {:?}", other),
            }
        }
    })
    .await
    .unwrap()
    .expect("close frame without payload");

    assert_eq!(frame.code, CloseCode::Away);
    assert_eq!(frame.reason, "Invalid credentials");
    assert_eq!(relay.broker.tunnel_count().await, 0);
    // The request stays claimable by its real owner
    assert_eq!(relay.broker.pending_count(), 1);
}

#[tokio::test]
async fn test_malformed_handshake_is_rejected() {
    let relay = relay(52400, 52599).await;
    let url = format!("ws://{}/ws", relay.api_addr);
    let (mut agent, _) = connect_async(url).await.unwrap();
    agent
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();

    let closed = timeout(WAIT, async {
        loop {
            match agent.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(closed, Some(CloseCode::Away));
}

#[tokio::test]
async fn test_socket_close_tears_down_tunnel() {
    let relay = relay(52600, 52799).await;
    let info = relay
        .broker
        .provision("alice", ProvisionRequest::tcp(), false)
        .unwrap();

    let mut agent = relay.agent(&handshake(&info)).await;
    relay.wait_for_tunnels(1).await;

    agent.close(None).await.unwrap();
    relay.wait_for_tunnels(0).await;

    // The public port goes back to the pool
    timeout(WAIT, async {
        while relay.broker.usage().using.contains(&info.port) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_deleting_tunnel_closes_socket() {
    let relay = relay(52800, 52999).await;
    let info = relay
        .broker
        .provision("alice", ProvisionRequest::tcp(), false)
        .unwrap();

    let mut agent = relay.agent(&handshake(&info)).await;
    relay.wait_for_tunnels(1).await;

    relay.broker.close("alice", &info.token).await.unwrap();

    let ended = timeout(WAIT, async {
        loop {
            match agent.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

const FAST_HEARTBEAT: Heartbeat = Heartbeat {
    interval: Duration::from_millis(100),
    timeout: Duration::from_millis(100),
};

#[tokio::test]
async fn test_silent_agent_is_dropped() {
    let relay = relay_with_heartbeat(53000, 53199, FAST_HEARTBEAT).await;
    let info = relay
        .broker
        .provision("alice", ProvisionRequest::tcp(), false)
        .unwrap();

    // Never read from the socket, so pings go unanswered
    let _agent = relay.agent(&handshake(&info)).await;
    relay.wait_for_tunnels(1).await;

    relay.wait_for_tunnels(0).await;
    timeout(WAIT, async {
        while relay.broker.usage().using.contains(&info.port) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_answering_agent_stays_connected() {
    let relay = relay_with_heartbeat(53200, 53399, FAST_HEARTBEAT).await;
    let info = relay
        .broker
        .provision("alice", ProvisionRequest::tcp(), false)
        .unwrap();

    let mut agent = relay.agent(&handshake(&info)).await;
    relay.wait_for_tunnels(1).await;

    // Reading lets tungstenite answer every ping with a pong
    let reader = tokio::spawn(async move { while let Some(Ok(_)) = agent.next().await {} });

    tokio::time::sleep(FAST_HEARTBEAT.deadline() * 4).await;
    assert_eq!(relay.broker.tunnel_count().await, 1);
    assert!(!reader.is_finished());
    reader.abort();
}
