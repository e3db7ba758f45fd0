//! Provisioned tunnels waiting for their agent's control handshake

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use burrow_proto::{Filter, Protocol, TunnelInfo, TOKEN_BYTES};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Generate a fresh tunnel token (URL-safe base64 of random bytes)
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE.encode(bytes)
}

/// A tunnel that has been provisioned but not yet activated.
///
/// `port` is already reserved in the port allocator; whoever drops the
/// request without activating it must release that port.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub name: Option<String>,
    pub owner: String,
    pub port: u16,
    pub protocol: Protocol,
    pub filter: Filter,
    pub token: String,
    pub created_at: Instant,
}

impl PendingRequest {
    pub fn new(
        name: Option<String>,
        owner: impl Into<String>,
        port: u16,
        protocol: Protocol,
        filter: Filter,
    ) -> Self {
        Self {
            name,
            owner: owner.into(),
            port,
            protocol,
            filter,
            token: generate_token(),
            created_at: Instant::now(),
        }
    }

    pub fn to_info(&self) -> TunnelInfo {
        TunnelInfo {
            name: self.name.clone(),
            user: self.owner.clone(),
            port: self.port,
            protocol: self.protocol,
            filter: self.filter.clone(),
            token: self.token.clone(),
        }
    }

    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

/// Pending requests keyed by owner, then token
#[derive(Default)]
pub struct PendingRequests {
    requests: Mutex<HashMap<String, HashMap<String, PendingRequest>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, PendingRequest>>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, request: PendingRequest) {
        self.lock()
            .entry(request.owner.clone())
            .or_default()
            .insert(request.token.clone(), request);
    }

    /// Remove and return the matching request. At most one caller can win.
    pub fn take(&self, owner: &str, token: &str) -> Option<PendingRequest> {
        let mut requests = self.lock();
        let by_token = requests.get_mut(owner)?;
        let request = by_token.remove(token);
        if by_token.is_empty() {
            requests.remove(owner);
        }
        request
    }

    pub fn contains(&self, owner: &str, token: &str) -> bool {
        self.lock()
            .get(owner)
            .is_some_and(|by_token| by_token.contains_key(token))
    }

    pub fn list(&self, owner: &str) -> Vec<TunnelInfo> {
        self.lock()
            .get(owner)
            .map(|by_token| by_token.values().map(PendingRequest::to_info).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every request older than `ttl` and hand them back
    pub fn drain_expired(&self, ttl: Duration) -> Vec<PendingRequest> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut requests = self.lock();
        for by_token in requests.values_mut() {
            let tokens: Vec<String> = by_token
                .iter()
                .filter(|(_, request)| request.is_expired(ttl, now))
                .map(|(token, _)| token.clone())
                .collect();
            for token in tokens {
                if let Some(request) = by_token.remove(&token) {
                    expired.push(request);
                }
            }
        }
        requests.retain(|_, by_token| !by_token.is_empty());
        expired
    }
}
