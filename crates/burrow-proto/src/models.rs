//! Provisioning and introspection payloads

use serde::{Deserialize, Serialize};

use crate::{Filter, Protocol};

/// Body of a provisioning call, also used for partial updates.
///
/// Every field is optional so the same shape serves `PATCH` requests;
/// provisioning requires `protocol`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

impl ProvisionRequest {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol: Some(protocol),
            ..Default::default()
        }
    }

    pub fn tcp() -> Self {
        Self::new(Protocol::Tcp)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Public description of a pending or live tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub name: Option<String>,
    pub user: String,
    pub port: u16,
    pub protocol: Protocol,
    pub filter: Filter,
    pub token: String,
}

/// Port capacity snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortUsage {
    pub start: u16,
    pub end: u16,
    /// Every port currently held, sorted ascending
    pub using: Vec<u16>,
}

/// Response body of the usage endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageResponse {
    pub port: PortUsage,
}
