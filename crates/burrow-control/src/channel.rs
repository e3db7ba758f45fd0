//! Control channel to a tunnel agent
//!
//! The broker only ever pushes `CreateTunnelRequest` packets down this
//! channel; the agent answers out of band by dialing the announced
//! rendezvous port. The transport (a WebSocket in the API crate) drains a
//! [`ControlReceiver`] while tunnel code holds the matching [`ControlSender`].

use async_trait::async_trait;
use burrow_proto::{ControlPacket, CreateTunnelRequest};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Packets queued before `send` starts waiting on the transport
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Control channel closed")]
    Closed,
}

#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Announce a rendezvous port to the agent
    async fn send_create_tunnel(&self, request: CreateTunnelRequest) -> Result<(), ChannelError>;

    /// Terminate the channel. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the channel has terminated, from either side
    async fn closed(&self);
}

/// Queue-backed [`ControlChannel`] half held by the tunnel
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::Sender<ControlPacket<CreateTunnelRequest>>,
    cancel: CancellationToken,
}

/// Transport half: yields packets to write to the agent
pub struct ControlReceiver {
    rx: mpsc::Receiver<ControlPacket<CreateTunnelRequest>>,
    cancel: CancellationToken,
}

impl ControlSender {
    pub fn channel(capacity: usize) -> (ControlSender, ControlReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        (
            ControlSender {
                tx,
                cancel: cancel.clone(),
            },
            ControlReceiver { rx, cancel },
        )
    }
}

#[async_trait]
impl ControlChannel for ControlSender {
    async fn send_create_tunnel(&self, request: CreateTunnelRequest) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let packet = ControlPacket::create_tunnel(request);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChannelError::Closed),
            res = self.tx.send(packet) => res.map_err(|_| ChannelError::Closed),
        }
    }

    fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Closing control channel");
            self.cancel.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

impl ControlReceiver {
    /// Next packet for the agent, or `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<ControlPacket<CreateTunnelRequest>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            packet = self.rx.recv() => packet,
        }
    }

    /// Signal that the transport is gone
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves when the tunnel side closed the channel
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for ControlReceiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
