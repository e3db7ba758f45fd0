use burrow_control::{ControlReceiver, ControlSender, PendingRequest, PortAllocator};
use burrow_proto::{CreateTunnelRequest, Filter, Protocol};
use burrow_server_tcp::{PublicListener, PublicListenerConfig, PublicListenerError};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(3);

struct Harness {
    allocator: Arc<PortAllocator>,
    listener: Arc<PublicListener>,
    control: ControlReceiver,
}

async fn start_tunnel(range: (u16, u16), filter: Filter, rendezvous_timeout: Duration) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let allocator = Arc::new(PortAllocator::new(range.0, range.1));
    let port = allocator.allocate().unwrap();
    let request = PendingRequest::new(None, "alice", port, Protocol::Tcp, filter);
    let (sender, control) = ControlSender::channel(8);

    let config = PublicListenerConfig {
        bind_ip: LOCALHOST,
        buffer_size: 1024,
        rendezvous_timeout,
    };
    let listener = PublicListener::start(request, Arc::new(sender), allocator.clone(), config)
        .await
        .unwrap();

    Harness {
        allocator,
        listener,
        control,
    }
}

async fn next_request(control: &mut ControlReceiver) -> CreateTunnelRequest {
    tokio::time::timeout(WAIT, control.recv())
        .await
        .expect("no CreateTunnelRequest sent")
        .expect("control channel closed")
        .data
        .expect("packet without data")
}

/// Connect a client to the tunnel and dial the announced rendezvous port
async fn open_leg(h: &mut Harness) -> (TcpStream, TcpStream, CreateTunnelRequest) {
    let client = TcpStream::connect((LOCALHOST, h.listener.port())).await.unwrap();
    let request = next_request(&mut h.control).await;
    let agent = TcpStream::connect((LOCALHOST, request.port)).await.unwrap();

    // Wait for the pair to be registered
    tokio::time::timeout(WAIT, async {
        while h.listener.leg_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    (client, agent, request)
}

async fn wait_released(allocator: &PortAllocator, port: u16) {
    tokio::time::timeout(WAIT, async {
        while allocator.is_in_use(port) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("port {} never released", port));
}

async fn assert_eof(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    let n = tokio::time::timeout(WAIT, stream.read_to_end(&mut rest))
        .await
        .expect("stream did not end")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_client_and_agent_are_spliced() {
    let mut h = start_tunnel((44000, 44199), Filter::default(), WAIT).await;
    let (mut client, mut agent, request) = open_leg(&mut h).await;

    assert_eq!(request.protocol, Protocol::Tcp);
    assert_eq!(request.address, "127.0.0.1");
    assert_ne!(request.port, h.listener.port());
    assert!(h.allocator.is_in_use(request.port));

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut buf = [0u8; 18];
    agent.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    agent.write_all(&payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);

    drop(client);
    assert_eof(&mut agent).await;
    wait_released(&h.allocator, request.port).await;
    assert_eq!(h.listener.leg_count(), 0);

    // Only the public port is left
    assert_eq!(h.allocator.usage().using, vec![h.listener.port()]);
}

#[tokio::test]
async fn test_blocked_client_gets_no_rendezvous() {
    let mut h = start_tunnel((44200, 44399), Filter::blacklist(["127.0.0.1"]), WAIT).await;

    let mut client = TcpStream::connect((LOCALHOST, h.listener.port())).await.unwrap();
    assert_eof(&mut client).await;

    let sent = tokio::time::timeout(Duration::from_millis(200), h.control.recv()).await;
    assert!(sent.is_err(), "blocked client must not trigger control traffic");
}

#[tokio::test]
async fn test_filter_update_closes_only_blocked_legs() {
    let mut h = start_tunnel((44400, 44599), Filter::default(), WAIT).await;
    let (mut client, mut agent, _) = open_leg(&mut h).await;

    // Unrelated address: the leg survives
    let closed = h
        .listener
        .update_filter(Filter::blacklist(["10.0.0.1"]))
        .unwrap();
    assert_eq!(closed, 0);
    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    agent.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");

    let closed = h
        .listener
        .update_filter(Filter::blacklist(["127.0.0.1"]))
        .unwrap();
    assert_eq!(closed, 1);
    assert_eq!(h.listener.leg_count(), 0);
    assert_eof(&mut client).await;
    assert_eof(&mut agent).await;

    // New clients see the new filter
    let mut late = TcpStream::connect((LOCALHOST, h.listener.port())).await.unwrap();
    assert_eof(&mut late).await;
    assert_eq!(h.listener.filter(), Filter::blacklist(["127.0.0.1"]));
}

#[tokio::test]
async fn test_invalid_filter_is_rejected() {
    let h = start_tunnel((44600, 44799), Filter::default(), WAIT).await;
    let res = h.listener.update_filter(Filter::blacklist(["not-an-ip"]));
    assert!(matches!(res, Err(PublicListenerError::InvalidFilter(_))));
    assert_eq!(h.listener.filter(), Filter::default());
}

#[tokio::test]
async fn test_close_unblocks_pending_rendezvous() {
    let mut h = start_tunnel((44800, 44999), Filter::default(), WAIT).await;
    let public_port = h.listener.port();

    let mut client = TcpStream::connect((LOCALHOST, public_port)).await.unwrap();
    let request = next_request(&mut h.control).await;

    h.listener.close();
    h.listener.close();
    assert!(h.listener.is_closed());

    assert_eof(&mut client).await;
    wait_released(&h.allocator, request.port).await;
    wait_released(&h.allocator, public_port).await;
    assert!(h.control.recv().await.is_none());

    tokio::time::timeout(WAIT, h.listener.closed()).await.unwrap();
}

#[tokio::test]
async fn test_close_drops_live_legs() {
    let mut h = start_tunnel((45000, 45199), Filter::default(), WAIT).await;
    let (mut client, mut agent, request) = open_leg(&mut h).await;
    let public_port = h.listener.port();

    h.listener.close();
    assert_eof(&mut client).await;
    assert_eof(&mut agent).await;
    wait_released(&h.allocator, request.port).await;
    wait_released(&h.allocator, public_port).await;
    assert_eq!(h.allocator.in_use_count(), 0);
}

#[tokio::test]
async fn test_rendezvous_timeout_drops_client() {
    let mut h = start_tunnel((45200, 45399), Filter::default(), Duration::from_millis(200)).await;

    let mut client = TcpStream::connect((LOCALHOST, h.listener.port())).await.unwrap();
    let request = next_request(&mut h.control).await;

    assert_eof(&mut client).await;
    wait_released(&h.allocator, request.port).await;
    assert!(!h.listener.is_closed());
}

#[tokio::test]
async fn test_update_port() {
    let mut h = start_tunnel((45400, 45599), Filter::default(), WAIT).await;
    let old_port = h.listener.port();
    let (mut client, mut agent, _) = open_leg(&mut h).await;

    // Conflict: nothing changes
    let taken = h.allocator.allocate().unwrap();
    let res = h.listener.update_port(taken).await;
    assert!(matches!(res, Err(PublicListenerError::PortConflict(p)) if p == taken));
    assert_eq!(h.listener.port(), old_port);

    let new_port = h.allocator.allocate().unwrap();
    h.allocator.release(new_port);
    h.listener.update_port(new_port).await.unwrap();
    assert_eq!(h.listener.port(), new_port);
    assert!(h.allocator.is_in_use(new_port));
    assert!(!h.allocator.is_in_use(old_port));

    // The running pair is untouched
    client.write_all(b"moved").await.unwrap();
    let mut buf = [0u8; 5];
    agent.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"moved");

    assert!(TcpStream::connect((LOCALHOST, old_port)).await.is_err());
    let _second = TcpStream::connect((LOCALHOST, new_port)).await.unwrap();
    let request = next_request(&mut h.control).await;
    assert_eq!(request.address, "127.0.0.1");

    h.listener.close();
    assert!(matches!(
        h.listener.update_port(old_port).await,
        Err(PublicListenerError::Closed)
    ));
}

#[tokio::test]
async fn test_lost_control_channel_drops_client() {
    let h = start_tunnel((45600, 45799), Filter::default(), WAIT).await;
    let Harness {
        allocator,
        listener,
        control,
    } = h;
    drop(control);

    let mut client = TcpStream::connect((LOCALHOST, listener.port())).await.unwrap();
    assert_eof(&mut client).await;

    // Only the public port is held
    tokio::time::timeout(WAIT, async {
        while allocator.in_use_count() != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_rename_and_info() {
    let h = start_tunnel((45800, 45999), Filter::default(), WAIT).await;
    assert_eq!(h.listener.name(), None);

    h.listener.rename(Some("db".to_string()));
    let info = h.listener.info();
    assert_eq!(info.name.as_deref(), Some("db"));
    assert_eq!(info.user, "alice");
    assert_eq!(info.port, h.listener.port());
    assert_eq!(info.token, h.listener.token());
    assert_eq!(info.protocol, Protocol::Tcp);
}

#[tokio::test]
async fn test_released_public_port_is_bindable() {
    let h = start_tunnel((43200, 43399), Filter::default(), WAIT).await;
    let port = h.listener.port();

    h.listener.close();

    // Whenever the allocator reports the port free, the socket is gone
    tokio::time::timeout(WAIT, async {
        loop {
            if !h.allocator.is_in_use(port) {
                assert!(std::net::TcpListener::bind((LOCALHOST, port)).is_ok());
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_shutdown_waits_for_port_release() {
    let h = start_tunnel((43400, 43599), Filter::default(), WAIT).await;
    let port = h.listener.port();

    tokio::time::timeout(WAIT, h.listener.shutdown()).await.unwrap();
    assert!(h.listener.is_closed());
    assert!(!h.allocator.is_in_use(port));
    assert!(std::net::TcpListener::bind((LOCALHOST, port)).is_ok());

    // Idempotent
    tokio::time::timeout(WAIT, h.listener.shutdown()).await.unwrap();
}
