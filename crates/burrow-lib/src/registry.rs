//! Live tunnels keyed by owner, then token

use burrow_server_tcp::PublicListener;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type Tunnels = HashMap<String, HashMap<String, Arc<PublicListener>>>;

/// Manages all live tunnels
#[derive(Default)]
pub struct ConnectionRegistry {
    tunnels: Arc<RwLock<Tunnels>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel under its owner and token, returning any previous entry
    pub async fn insert(&self, tunnel: Arc<PublicListener>) -> Option<Arc<PublicListener>> {
        self.tunnels
            .write()
            .await
            .entry(tunnel.owner().to_string())
            .or_default()
            .insert(tunnel.token().to_string(), tunnel)
    }

    pub async fn get(&self, owner: &str, token: &str) -> Option<Arc<PublicListener>> {
        self.tunnels
            .read()
            .await
            .get(owner)
            .and_then(|by_token| by_token.get(token))
            .cloned()
    }

    pub async fn remove(&self, owner: &str, token: &str) -> Option<Arc<PublicListener>> {
        let mut tunnels = self.tunnels.write().await;
        let by_token = tunnels.get_mut(owner)?;
        let tunnel = by_token.remove(token);
        if by_token.is_empty() {
            tunnels.remove(owner);
        }
        tunnel
    }

    /// Remove the entry only if it still is `tunnel`
    pub async fn remove_if_same(&self, tunnel: &Arc<PublicListener>) -> bool {
        let mut tunnels = self.tunnels.write().await;
        let Some(by_token) = tunnels.get_mut(tunnel.owner()) else {
            return false;
        };
        let same = by_token
            .get(tunnel.token())
            .is_some_and(|current| Arc::ptr_eq(current, tunnel));
        if same {
            by_token.remove(tunnel.token());
            if by_token.is_empty() {
                tunnels.remove(tunnel.owner());
            }
        }
        same
    }

    pub async fn remove_owner(&self, owner: &str) -> Vec<Arc<PublicListener>> {
        self.tunnels
            .write()
            .await
            .remove(owner)
            .map(|by_token| by_token.into_values().collect())
            .unwrap_or_default()
    }

    pub async fn drain(&self) -> Vec<Arc<PublicListener>> {
        self.tunnels
            .write()
            .await
            .drain()
            .flat_map(|(_, by_token)| by_token.into_values())
            .collect()
    }

    pub async fn list(&self, owner: &str) -> Vec<Arc<PublicListener>> {
        self.tunnels
            .read()
            .await
            .get(owner)
            .map(|by_token| by_token.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
