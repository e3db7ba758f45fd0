//! API request and response bodies
//!
//! Tunnel payloads themselves (`ProvisionRequest`, `TunnelInfo`,
//! `UsageResponse`) live in the protocol crate; these are the small
//! envelopes around single fields.

use burrow_lib::{Filter, Protocol};
use serde::{Deserialize, Serialize};

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Live tunnels count
    pub active_tunnels: usize,
    /// Provisioned tunnels waiting for their agent
    pub pending_tunnels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseAllResponse {
    pub message: String,
    pub closed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NameBody {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBody {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolBody {
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBody {
    pub user: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterBody {
    #[serde(default)]
    pub filter: Filter,
}
