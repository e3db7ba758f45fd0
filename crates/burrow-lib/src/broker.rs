//! Tunnel broker: provisioning, activation and lifecycle of every tunnel
//!
//! A tunnel is created in two steps. `provision` reserves a public port and
//! parks a [`PendingRequest`] under a fresh token; `activate` is called when
//! the agent's control handshake presents that token, and turns the request
//! into a running [`PublicListener`] registered under the same
//! `(owner, token)` pair.

use burrow_control::{ControlChannel, PendingRequest, PendingRequests, PortAllocator, PortAllocatorError};
use burrow_proto::{Filter, FilterError, PortUsage, Protocol, ProvisionRequest, TunnelInfo};
use burrow_server_tcp::{PublicListener, PublicListenerError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::registry::ConnectionRegistry;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("No free port left in range {start}-{end}")]
    ExhaustedRange { start: u16, end: u16 },

    #[error("Port {0} is already in use")]
    PortConflict(u16),

    #[error("Port {0} is not a valid port")]
    InvalidPort(u16),

    #[error("Tunnel not found")]
    NotFound,

    #[error("No pending request matches this token")]
    NoSuchPendingRequest,

    #[error("A protocol must be specified")]
    MissingProtocol,

    #[error("Protocol {0} is not supported")]
    UnsupportedProtocol(Protocol),

    #[error("Invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),

    #[error("Tunnel error: {0}")]
    Listener(PublicListenerError),
}

impl From<PortAllocatorError> for BrokerError {
    fn from(e: PortAllocatorError) -> Self {
        match e {
            PortAllocatorError::Exhausted { start, end } => BrokerError::ExhaustedRange { start, end },
            PortAllocatorError::InUse(port) => BrokerError::PortConflict(port),
            PortAllocatorError::InvalidPort(port) => BrokerError::InvalidPort(port),
        }
    }
}

impl From<PublicListenerError> for BrokerError {
    fn from(e: PublicListenerError) -> Self {
        match e {
            PublicListenerError::PortConflict(port) => BrokerError::PortConflict(port),
            PublicListenerError::PortAllocation(e) => e.into(),
            PublicListenerError::InvalidFilter(e) => BrokerError::InvalidFilter(e),
            PublicListenerError::Closed => BrokerError::NotFound,
            other => BrokerError::Listener(other),
        }
    }
}

pub struct Broker {
    config: BrokerConfig,
    allocator: Arc<PortAllocator>,
    pending: PendingRequests,
    registry: Arc<ConnectionRegistry>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let allocator = Arc::new(
            PortAllocator::new(config.port_range_start, config.port_range_end)
                .with_probe_ip(config.bind_ip),
        );
        Self {
            config,
            allocator,
            pending: PendingRequests::new(),
            registry: Arc::new(ConnectionRegistry::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    /// Phase 1: reserve a public port and park the request under a new token.
    ///
    /// Only callers allowed to pick their port (`may_select_port`) have
    /// `request.port` honoured; everyone else gets a random free port. No
    /// socket is opened yet.
    pub fn provision(
        &self,
        owner: &str,
        request: ProvisionRequest,
        may_select_port: bool,
    ) -> Result<TunnelInfo, BrokerError> {
        let protocol = request.protocol.ok_or(BrokerError::MissingProtocol)?;
        if protocol != Protocol::Tcp {
            return Err(BrokerError::UnsupportedProtocol(protocol));
        }

        let filter = request.filter.unwrap_or_default();
        filter.validate()?;

        let port = match request.port {
            Some(port) if may_select_port => {
                self.allocator.reserve(port)?;
                port
            }
            _ => self.allocator.allocate()?,
        };

        let pending = PendingRequest::new(request.name, owner, port, protocol, filter);
        let info = pending.to_info();
        self.pending.insert(pending);

        info!("Provisioned {} tunnel for {} on port {}", protocol, owner, port);
        Ok(info)
    }

    /// Phase 2: bind the tunnel once its agent shows up with `token`.
    ///
    /// The pending request is consumed whatever happens next. On any
    /// failure the channel is closed and the reserved port released. Losing
    /// the channel later closes the tunnel.
    pub async fn activate(
        &self,
        owner: &str,
        token: &str,
        channel: Arc<dyn ControlChannel>,
    ) -> Result<Arc<PublicListener>, BrokerError> {
        let Some(pending) = self.pending.take(owner, token) else {
            debug!("Rejected control handshake from {}: unknown token", owner);
            channel.close();
            return Err(BrokerError::NoSuchPendingRequest);
        };

        let tunnel = match PublicListener::start(
            pending,
            channel.clone(),
            self.allocator.clone(),
            self.config.listener_config(),
        )
        .await
        {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!("Failed to activate tunnel for {}: {}", owner, e);
                channel.close();
                return Err(e.into());
            }
        };

        if let Some(previous) = self.registry.insert(tunnel.clone()).await {
            previous.close();
        }
        self.watch_control_channel(tunnel.clone(), channel);

        info!("Tunnel for {} active on port {}", owner, tunnel.port());
        Ok(tunnel)
    }

    fn watch_control_channel(&self, tunnel: Arc<PublicListener>, channel: Arc<dyn ControlChannel>) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = channel.closed() => {
                    if registry.remove_if_same(&tunnel).await {
                        info!(
                            "Control channel for {} lost, closing tunnel on port {}",
                            tunnel.owner(),
                            tunnel.port()
                        );
                    }
                    tunnel.close();
                }
                _ = tunnel.closed() => {}
            }
        });
    }

    /// Live tunnels of `owner`
    pub async fn list(&self, owner: &str) -> Vec<TunnelInfo> {
        self.registry
            .list(owner)
            .await
            .iter()
            .map(|tunnel| tunnel.info())
            .collect()
    }

    /// Provisioned tunnels of `owner` still waiting for their agent
    pub fn list_pending(&self, owner: &str) -> Vec<TunnelInfo> {
        self.pending.list(owner)
    }

    pub async fn get(&self, owner: &str, token: &str) -> Result<Arc<PublicListener>, BrokerError> {
        self.registry
            .get(owner, token)
            .await
            .ok_or(BrokerError::NotFound)
    }

    /// Close a live tunnel, or withdraw a pending request
    pub async fn close(&self, owner: &str, token: &str) -> Result<(), BrokerError> {
        if let Some(tunnel) = self.registry.remove(owner, token).await {
            tunnel.shutdown().await;
            return Ok(());
        }
        if let Some(pending) = self.pending.take(owner, token) {
            self.allocator.release(pending.port);
            debug!("Withdrew pending tunnel for {} on port {}", owner, pending.port);
            return Ok(());
        }
        Err(BrokerError::NotFound)
    }

    /// Close every live tunnel of `owner` and wait for their ports to be
    /// released. Returns how many were closed.
    pub async fn close_all(&self, owner: &str) -> usize {
        let tunnels = self.registry.remove_owner(owner).await;
        for tunnel in &tunnels {
            tunnel.close();
        }
        for tunnel in &tunnels {
            tunnel.shutdown().await;
        }
        if !tunnels.is_empty() {
            info!("Closed {} tunnel(s) for {}", tunnels.len(), owner);
        }
        tunnels.len()
    }

    /// Replace a tunnel's filter. Returns the number of live connections closed.
    pub async fn update_filter(
        &self,
        owner: &str,
        token: &str,
        filter: Filter,
    ) -> Result<usize, BrokerError> {
        let tunnel = self.get(owner, token).await?;
        Ok(tunnel.update_filter(filter)?)
    }

    pub async fn update_port(&self, owner: &str, token: &str, port: u16) -> Result<(), BrokerError> {
        let tunnel = self.get(owner, token).await?;
        tunnel.update_port(port).await?;
        Ok(())
    }

    pub async fn rename(
        &self,
        owner: &str,
        token: &str,
        name: Option<String>,
    ) -> Result<(), BrokerError> {
        self.get(owner, token).await?.rename(name);
        Ok(())
    }

    /// Ports currently held by live tunnels, rendezvous listeners and
    /// pending requests
    pub fn usage(&self) -> PortUsage {
        self.allocator.usage()
    }

    pub async fn tunnel_count(&self) -> usize {
        self.registry.len().await
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop pending requests older than the configured TTL and release
    /// their ports. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.config.pending_ttl else {
            return 0;
        };
        let expired = self.pending.drain_expired(ttl);
        for request in &expired {
            self.allocator.release(request.port);
            debug!(
                "Pending tunnel for {} on port {} expired",
                request.owner, request.port
            );
        }
        expired.len()
    }

    /// Periodically evict expired pending requests until `cancel` fires.
    /// Does nothing when no TTL is configured.
    pub fn spawn_pending_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let ttl = self.config.pending_ttl?;
        let period = (ttl / 2).clamp(Duration::from_millis(100), Duration::from_secs(60));
        let broker = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = broker.sweep_expired();
                        if expired > 0 {
                            info!("Evicted {} expired pending tunnel(s)", expired);
                        }
                    }
                }
            }
        }))
    }

    /// Close every tunnel and drop every pending request
    pub async fn shutdown(&self) {
        let tunnels = self.registry.drain().await;
        for tunnel in &tunnels {
            tunnel.close();
        }
        for tunnel in &tunnels {
            tunnel.shutdown().await;
        }
        let pending = self.pending.drain_expired(Duration::ZERO);
        for request in &pending {
            self.allocator.release(request.port);
        }
        info!(
            "Broker shut down ({} tunnel(s), {} pending request(s))",
            tunnels.len(),
            pending.len()
        );
    }
}
