//! Burrow library - the tunnel broker as a reusable service
//!
//! [`Broker`] ties the port allocator, the pending-request table and the
//! live [`ConnectionRegistry`] together behind the operations the HTTP and
//! control layers need. The lower-level crates are re-exported so embedders
//! only depend on this one.
//!
//! ```ignore
//! use burrow_lib::{Broker, BrokerConfig, ControlSender, ProvisionRequest, Protocol};
//! use std::sync::Arc;
//!
//! let broker = Arc::new(Broker::new(BrokerConfig::default()));
//! let info = broker.provision("alice", ProvisionRequest::tcp(), false)?;
//!
//! // Later, when the agent's control connection presents the token:
//! let (sender, receiver) = ControlSender::channel(64);
//! let tunnel = broker.activate("alice", &info.token, Arc::new(sender)).await?;
//! ```

mod broker;
mod config;
mod registry;

pub use broker::{Broker, BrokerError};
pub use config::BrokerConfig;
pub use registry::ConnectionRegistry;

pub use burrow_control::{
    ChannelError, ControlChannel, ControlReceiver, ControlSender, DEFAULT_CHANNEL_CAPACITY,
};
pub use burrow_proto::{
    ControlHandshake, ControlPacket, CreateTunnelRequest, Filter, FilterType, PacketType,
    PortUsage, Protocol, ProvisionRequest, TunnelInfo, UsageResponse,
};
pub use burrow_server_tcp::{PublicListener, PublicListenerError};
