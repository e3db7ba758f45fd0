//! Control channel message types

use serde::{Deserialize, Serialize};

/// Transport protocol of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    /// Accepted on the wire but has no data plane; the broker rejects it
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Kind of payload carried by a [`ControlPacket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
    CreateTunnel,
}

/// Envelope for every message the broker sends to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPacket<T> {
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    pub data: Option<T>,
}

impl<T> ControlPacket<T> {
    pub fn new(packet_type: PacketType, data: T) -> Self {
        Self {
            packet_type,
            data: Some(data),
        }
    }
}

impl ControlPacket<CreateTunnelRequest> {
    pub fn create_tunnel(request: CreateTunnelRequest) -> Self {
        Self::new(PacketType::CreateTunnel, request)
    }
}

/// Asks the agent to dial the rendezvous port for one public connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTunnelRequest {
    /// Rendezvous port the agent must connect to
    pub port: u16,
    pub protocol: Protocol,
    /// Textual IP of the public client
    pub address: String,
    /// Issue time in milliseconds since the Unix epoch
    pub iat: i64,
}

impl CreateTunnelRequest {
    pub fn new(port: u16, protocol: Protocol, address: impl Into<String>) -> Self {
        let iat = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            port,
            protocol,
            address: address.into(),
            iat,
        }
    }
}

/// First frame an agent sends on its control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlHandshake {
    pub user: String,
    pub token: String,
}
