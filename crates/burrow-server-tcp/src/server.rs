//! Public listener: one per live tunnel
//!
//! Owns the externally visible port. Every accepted client is checked
//! against the tunnel's filter, paired with an agent connection through a
//! fresh [`RendezvousListener`], and spliced by a [`LegPair`].

use burrow_control::{ChannelError, ControlChannel, PendingRequest, PortAllocator, PortAllocatorError};
use burrow_proto::{
    CreateTunnelRequest, Filter, FilterError, Protocol, TunnelInfo, DEFAULT_BUFFER_SIZE,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::legs::LegSet;
use crate::pump::{run_leg_pair, LegPair};
use crate::rendezvous::{RendezvousError, RendezvousListener};

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum PublicListenerError {
    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Port {0} is already in use")]
    PortConflict(u16),

    #[error("Port allocation failed: {0}")]
    PortAllocation(PortAllocatorError),

    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),

    #[error("Control channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Rendezvous failed: {0}")]
    Rendezvous(#[from] RendezvousError),

    #[error("Agent did not reach rendezvous port {0} in time")]
    RendezvousTimeout(u16),

    #[error("Tunnel closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PortAllocatorError> for PublicListenerError {
    fn from(e: PortAllocatorError) -> Self {
        match e {
            PortAllocatorError::InUse(port) => PublicListenerError::PortConflict(port),
            other => PublicListenerError::PortAllocation(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublicListenerConfig {
    /// Address public and rendezvous listeners bind to
    pub bind_ip: IpAddr,
    pub buffer_size: usize,
    /// How long a client waits for the agent to dial its rendezvous port
    pub rendezvous_timeout: Duration,
}

impl Default for PublicListenerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            buffer_size: DEFAULT_BUFFER_SIZE,
            rendezvous_timeout: Duration::from_secs(30),
        }
    }
}

/// State shared by the accept loop and every per-connection task
struct ConnectionContext {
    protocol: Protocol,
    filter: RwLock<Filter>,
    legs: LegSet,
    channel: Arc<dyn ControlChannel>,
    allocator: Arc<PortAllocator>,
    config: PublicListenerConfig,
    shutdown: CancellationToken,
}

/// Port and lifecycle flag change together, so `close` and `update_port`
/// always agree on which port is still held.
struct Binding {
    port: u16,
    closed: bool,
}

/// A bound public socket. Dropping it closes the socket first and only
/// then gives the port back, so a released port is always bindable.
struct PublicSocket {
    listener: Option<TcpListener>,
    port: u16,
    allocator: Arc<PortAllocator>,
    released: CancellationToken,
}

impl PublicSocket {
    fn new(listener: TcpListener, port: u16, allocator: Arc<PortAllocator>) -> Self {
        Self {
            listener: Some(listener),
            port,
            allocator,
            released: CancellationToken::new(),
        }
    }
}

impl Drop for PublicSocket {
    fn drop(&mut self) {
        drop(self.listener.take());
        self.allocator.release(self.port);
        self.released.cancel();
    }
}

struct AcceptLoop {
    cancel: CancellationToken,
    /// Fires once the loop's socket is closed and its port released
    released: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PublicListener {
    owner: String,
    token: String,
    name: RwLock<Option<String>>,
    binding: Mutex<Binding>,
    accept_loop: tokio::sync::Mutex<AcceptLoop>,
    ctx: Arc<ConnectionContext>,
}

impl PublicListener {
    /// Bind the request's port and start accepting clients.
    ///
    /// The port must already be reserved in `allocator`. From here on the
    /// listener owns it: on failure the port is released before returning.
    pub async fn start(
        request: PendingRequest,
        channel: Arc<dyn ControlChannel>,
        allocator: Arc<PortAllocator>,
        config: PublicListenerConfig,
    ) -> Result<Arc<Self>, PublicListenerError> {
        let PendingRequest {
            name,
            owner,
            port,
            protocol,
            filter,
            token,
            ..
        } = request;

        let listener = match filter.validate() {
            Ok(()) => bind_with_retry(config.bind_ip, port).await,
            Err(e) => Err(e.into()),
        };
        let socket = match listener {
            Ok(listener) => PublicSocket::new(listener, port, allocator.clone()),
            Err(e) => {
                allocator.release(port);
                return Err(e);
            }
        };

        let ctx = Arc::new(ConnectionContext {
            protocol,
            filter: RwLock::new(filter),
            legs: LegSet::new(),
            channel,
            allocator,
            config,
            shutdown: CancellationToken::new(),
        });

        info!("Tunnel for {} listening on port {}", owner, port);

        Ok(Arc::new(Self {
            owner,
            token,
            name: RwLock::new(name),
            binding: Mutex::new(Binding {
                port,
                closed: false,
            }),
            accept_loop: tokio::sync::Mutex::new(AcceptLoop::spawn(ctx.clone(), socket)),
            ctx,
        }))
    }

    fn binding(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn protocol(&self) -> Protocol {
        self.ctx.protocol
    }

    pub fn port(&self) -> u16 {
        self.binding().port
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn rename(&self, name: Option<String>) {
        *self.name.write().unwrap_or_else(|e| e.into_inner()) = name;
    }

    pub fn filter(&self) -> Filter {
        self.ctx.filter_read().clone()
    }

    /// Number of live leg pairs
    pub fn leg_count(&self) -> usize {
        self.ctx.legs.len()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            name: self.name(),
            user: self.owner.clone(),
            port: self.port(),
            protocol: self.protocol(),
            filter: self.filter(),
            token: self.token.clone(),
        }
    }

    /// Swap the filter and close every live pair it now blocks.
    ///
    /// New clients see the new filter as soon as this returns. Returns the
    /// number of pairs closed.
    pub fn update_filter(&self, filter: Filter) -> Result<usize, PublicListenerError> {
        filter.validate()?;
        if self.is_closed() {
            return Err(PublicListenerError::Closed);
        }

        let mut current = self.ctx.filter_write();
        *current = filter;
        let closed = self.ctx.legs.close_blocked(&current);
        drop(current);

        if closed > 0 {
            info!(
                "Filter update on port {} closed {} connection(s)",
                self.port(),
                closed
            );
        }
        Ok(closed)
    }

    /// Move the tunnel to `port`.
    ///
    /// The new port is reserved and bound before the old accept loop stops,
    /// so a failed move leaves the tunnel serving on its old port. Pairs
    /// already running are not touched.
    pub async fn update_port(&self, port: u16) -> Result<(), PublicListenerError> {
        let mut accept_loop = self.accept_loop.lock().await;

        let current = {
            let binding = self.binding();
            if binding.closed {
                return Err(PublicListenerError::Closed);
            }
            binding.port
        };
        if port == current {
            return Ok(());
        }

        self.ctx.allocator.reserve(port)?;
        let socket = match bind_with_retry(self.ctx.config.bind_ip, port).await {
            Ok(listener) => PublicSocket::new(listener, port, self.ctx.allocator.clone()),
            Err(e) => {
                self.ctx.allocator.release(port);
                return Err(e);
            }
        };

        {
            let mut binding = self.binding();
            if binding.closed {
                drop(binding);
                drop(socket);
                return Err(PublicListenerError::Closed);
            }
            binding.port = port;
        }

        // The old loop releases `current` once its socket is gone
        let previous = std::mem::replace(
            &mut *accept_loop,
            AcceptLoop::spawn(self.ctx.clone(), socket),
        );
        previous.stop().await;

        info!("Tunnel moved from port {} to {}", current, port);
        Ok(())
    }

    /// Tear the tunnel down: stop accepting, close every pair and pending
    /// rendezvous, and close the control channel. Idempotent.
    ///
    /// The public port is released by the accept loop once its socket is
    /// closed; [`PublicListener::shutdown`] waits for that.
    pub fn close(&self) {
        let port = {
            let mut binding = self.binding();
            if binding.closed {
                return;
            }
            binding.closed = true;
            binding.port
        };

        self.ctx.shutdown.cancel();
        let legs = self.ctx.legs.close_all();
        self.ctx.channel.close();

        info!(
            "Tunnel on port {} closed ({} live connection(s) dropped)",
            port, legs
        );
    }

    /// Close the tunnel and wait until its public port is free again
    pub async fn shutdown(&self) {
        self.close();
        let released = self.accept_loop.lock().await.released.clone();
        released.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.binding().closed
    }

    /// Resolves once the tunnel has been closed
    pub async fn closed(&self) {
        self.ctx.shutdown.cancelled().await
    }
}

impl Drop for PublicListener {
    fn drop(&mut self) {
        self.close();
    }
}

impl AcceptLoop {
    fn spawn(ctx: Arc<ConnectionContext>, socket: PublicSocket) -> Self {
        let cancel = ctx.shutdown.child_token();
        let released = socket.released.clone();
        let handle = tokio::spawn(accept_loop(ctx, socket, cancel.clone()));
        Self {
            cancel,
            released,
            handle,
        }
    }

    /// Stop accepting and wait until the socket is gone and its port released
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Accept loop ended abnormally: {}", e);
        }
    }
}

async fn accept_loop(ctx: Arc<ConnectionContext>, socket: PublicSocket, cancel: CancellationToken) {
    let port = socket.port;
    let Some(listener) = socket.listener.as_ref() else {
        return;
    };
    debug!("Accept loop started on port {}", port);

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = ctx.handle_connection(stream, peer_addr).await {
                        debug!("Connection from {} dropped: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept TCP connection on port {}: {}", port, e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    debug!("Accept loop on port {} stopped", port);
    drop(socket);
}

impl ConnectionContext {
    fn filter_read(&self) -> RwLockReadGuard<'_, Filter> {
        self.filter.read().unwrap_or_else(|e| e.into_inner())
    }

    fn filter_write(&self) -> RwLockWriteGuard<'_, Filter> {
        self.filter.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn handle_connection(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), PublicListenerError> {
        let address = peer_addr.ip().to_canonical().to_string();

        if self.filter_read().blocks(&address) {
            debug!("Blocked connection from {}", address);
            return Ok(());
        }

        let rendezvous = RendezvousListener::bind(
            self.config.bind_ip,
            self.allocator.clone(),
            self.shutdown.child_token(),
        )
        .await?;
        let rendezvous_port = rendezvous.port();

        self.channel
            .send_create_tunnel(CreateTunnelRequest::new(
                rendezvous_port,
                self.protocol,
                address.as_str(),
            ))
            .await?;

        let agent = tokio::time::timeout(self.config.rendezvous_timeout, rendezvous.get())
            .await
            .map_err(|_| PublicListenerError::RendezvousTimeout(rendezvous_port))??;

        let leg = LegPair::new(address.as_str(), self.shutdown.child_token());
        {
            // The filter may have changed while the agent was dialing
            let filter = self.filter_read();
            if filter.blocks(&address) {
                debug!("Connection from {} filtered during rendezvous", address);
                return Ok(());
            }
            self.legs.insert(leg.clone());
        }

        debug!(
            "Leg {} established for {} via rendezvous port {}",
            leg.id(),
            address,
            rendezvous_port
        );
        let summary = run_leg_pair(client, agent, self.config.buffer_size, &leg).await;

        self.legs.remove(&leg);
        rendezvous.close();

        debug!(
            "Leg {} for {} finished ({} bytes in, {} bytes out)",
            leg.id(),
            address,
            summary.client_to_agent,
            summary.agent_to_client
        );
        Ok(())
    }
}

async fn bind_with_retry(ip: IpAddr, port: u16) -> Result<TcpListener, PublicListenerError> {
    let addr = SocketAddr::new(ip, port);
    let mut reason = String::from("Address in use");

    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if attempt > 1 {
                    info!(
                        "Bound to {} on attempt {}/{}",
                        addr, attempt, BIND_ATTEMPTS
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                warn!(
                    "Port {} is in use (attempt {}/{}), retrying",
                    port, attempt, BIND_ATTEMPTS
                );
                reason = e.to_string();
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => {
                reason = e.to_string();
                break;
            }
        }
    }

    Err(PublicListenerError::BindError {
        address: ip.to_string(),
        port,
        reason,
    })
}
