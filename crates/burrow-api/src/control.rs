//! WebSocket control endpoint for tunnel agents
//!
//! An agent opens `/ws`, sends one `ControlHandshake` text frame naming the
//! owner and pending token, then receives a `CREATE_TUNNEL` packet for every
//! public connection. The tunnel lives exactly as long as this socket, and
//! a socket that stays silent past the [`Heartbeat`] deadline counts as gone.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use burrow_lib::{ControlHandshake, ControlReceiver, ControlSender, DEFAULT_CHANNEL_CAPACITY};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::AppState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Keep-alive settings for agent sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// How often the relay pings the agent
    pub interval: Duration,
    /// Extra silence tolerated after a ping before the agent is dropped
    pub timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(15),
        }
    }
}

impl Heartbeat {
    /// Longest silence from the agent before its socket is considered dead
    pub fn deadline(&self) -> Duration {
        self.interval + self.timeout
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let Some(handshake) = read_handshake(&mut socket).await else {
        reject(socket, "Invalid handshake").await;
        return;
    };

    let (sender, receiver) = ControlSender::channel(DEFAULT_CHANNEL_CAPACITY);
    let tunnel = match state
        .broker
        .activate(&handshake.user, &handshake.token, Arc::new(sender))
        .await
    {
        Ok(tunnel) => tunnel,
        Err(e) => {
            debug!("Control handshake from {} refused: {}", handshake.user, e);
            reject(socket, "Invalid credentials").await;
            return;
        }
    };

    info!(
        "Agent for {} connected, tunnel on port {}",
        handshake.user,
        tunnel.port()
    );
    relay_packets(socket, receiver, state.heartbeat).await;
    info!(
        "Agent for {} disconnected from tunnel on port {}",
        handshake.user,
        tunnel.port()
    );
}

async fn read_handshake(socket: &mut WebSocket) -> Option<ControlHandshake> {
    let message = match tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(message))) => message,
        Ok(Some(Err(e))) => {
            debug!("WebSocket error before handshake: {}", e);
            return None;
        }
        Ok(None) => return None,
        Err(_) => {
            debug!("Control handshake timed out");
            return None;
        }
    };

    match message {
        Message::Text(text) => match serde_json::from_str(text.as_str()) {
            Ok(handshake) => Some(handshake),
            Err(e) => {
                debug!("Malformed control handshake: {}", e);
                None
            }
        },
        _ => None,
    }
}

async fn reject(mut socket: WebSocket, reason: &str) {
    let frame = CloseFrame {
        code: close_code::AWAY,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

/// A write that cannot complete within the heartbeat deadline means the
/// agent stopped reading
async fn send_within(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    message: Message,
    heartbeat: Heartbeat,
) -> bool {
    match tokio::time::timeout(heartbeat.deadline(), ws_tx.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Failed to write to control socket: {}", e);
            false
        }
        Err(_) => {
            debug!("Control socket write stalled");
            false
        }
    }
}

/// Forward queued packets to the agent until either side goes away.
/// Frames from the agent only count as signs of life.
async fn relay_packets(socket: WebSocket, mut receiver: ControlReceiver, heartbeat: Heartbeat) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut ping = tokio::time::interval(heartbeat.interval);
    ping.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            packet = receiver.recv() => {
                let Some(packet) = packet else {
                    debug!("Tunnel closed, ending control session");
                    break;
                };
                let json = match serde_json::to_string(&packet) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize control packet: {}", e);
                        continue;
                    }
                };
                if !send_within(&mut ws_tx, Message::Text(json.into()), heartbeat).await {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => {
                        debug!("Control socket error: {}", e);
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > heartbeat.deadline() {
                    warn!(
                        "Agent silent for {:?}, dropping control session",
                        last_seen.elapsed()
                    );
                    break;
                }
                if !send_within(&mut ws_tx, Message::Ping(Vec::new().into()), heartbeat).await {
                    break;
                }
            }
        }
    }

    receiver.close();
    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "Tunnel closed".into(),
    }));
    send_within(&mut ws_tx, close, heartbeat).await;
}
