//! One-shot listener the agent dials back into

use burrow_control::{PortAllocator, PortAllocatorError};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Fresh ports tried when the OS refuses a bind
const BIND_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("Rendezvous listener closed")]
    Closed,

    #[error("Port allocation failed: {0}")]
    PortAllocation(#[from] PortAllocatorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener on a dedicated port taken from the allocator at bind time.
///
/// Closing it (explicitly, through the parent token, or by dropping it)
/// fails any pending [`RendezvousListener::get`] with
/// [`RendezvousError::Closed`] and hands the port back exactly once.
pub struct RendezvousListener {
    port: u16,
    listener: TcpListener,
    allocator: Arc<PortAllocator>,
    cancel: CancellationToken,
    released: AtomicBool,
}

impl RendezvousListener {
    /// Allocate a random free port and bind it.
    ///
    /// `cancel` is normally a child of the owning tunnel's token, so closing
    /// the tunnel closes the listener as well.
    pub async fn bind(
        bind_ip: IpAddr,
        allocator: Arc<PortAllocator>,
        cancel: CancellationToken,
    ) -> Result<Self, RendezvousError> {
        let mut last_error = None;

        for attempt in 1..=BIND_ATTEMPTS {
            let port = allocator.allocate()?;
            match TcpListener::bind(SocketAddr::new(bind_ip, port)).await {
                Ok(listener) => {
                    trace!("Rendezvous listener bound on port {}", port);
                    return Ok(Self {
                        port,
                        listener,
                        allocator,
                        cancel,
                        released: AtomicBool::new(false),
                    });
                }
                Err(e) => {
                    warn!(
                        "Failed to bind rendezvous port {} (attempt {}/{}): {}",
                        port, attempt, BIND_ATTEMPTS, e
                    );
                    allocator.release(port);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .map(RendezvousError::Io)
            .unwrap_or(RendezvousError::Closed))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the agent's inbound connection
    pub async fn get(&self) -> Result<TcpStream, RendezvousError> {
        if self.is_closed() {
            return Err(RendezvousError::Closed);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RendezvousError::Closed),
            res = self.listener.accept() => {
                let (stream, peer) = res?;
                debug!("Agent connected to rendezvous port {} from {}", self.port, peer);
                Ok(stream)
            }
        }
    }

    /// Close the listener. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        if !self.released.swap(true, Ordering::AcqRel) {
            self.allocator.release(self.port);
            trace!("Rendezvous port {} released", self.port);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for RendezvousListener {
    fn drop(&mut self) {
        self.close();
    }
}
