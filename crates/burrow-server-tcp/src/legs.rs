//! Live leg pairs of one tunnel, indexed by peer address

use burrow_proto::Filter;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::pump::LegPair;

#[derive(Default)]
pub struct LegSet {
    legs: Mutex<HashMap<String, HashMap<u64, LegPair>>>,
}

impl LegSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<u64, LegPair>>> {
        self.legs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, leg: LegPair) {
        self.lock()
            .entry(leg.peer_address().to_string())
            .or_default()
            .insert(leg.id(), leg);
    }

    /// Drop a finished pair from tracking. Returns false if it was already gone.
    pub fn remove(&self, leg: &LegPair) -> bool {
        let mut legs = self.lock();
        let Some(by_id) = legs.get_mut(leg.peer_address()) else {
            return false;
        };
        let removed = by_id.remove(&leg.id()).is_some();
        if by_id.is_empty() {
            legs.remove(leg.peer_address());
        }
        removed
    }

    /// Close and forget every pair whose peer `filter` now blocks.
    ///
    /// Both directions of a pair share one token, so each address is fully
    /// closed before the next one is looked at.
    pub fn close_blocked(&self, filter: &Filter) -> usize {
        let mut legs = self.lock();
        let blocked: Vec<String> = legs
            .keys()
            .filter(|address| filter.blocks(address))
            .cloned()
            .collect();

        let mut closed = 0;
        for address in blocked {
            if let Some(by_id) = legs.remove(&address) {
                debug!(
                    "Closing {} connection(s) from {} (now filtered)",
                    by_id.len(),
                    address
                );
                for leg in by_id.values() {
                    leg.close();
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Close and forget every pair
    pub fn close_all(&self) -> usize {
        let drained: Vec<LegPair> = self
            .lock()
            .drain()
            .flat_map(|(_, by_id)| by_id.into_values())
            .collect();
        for leg in &drained {
            leg.close();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn count_for(&self, address: &str) -> usize {
        self.lock().get(address).map(HashMap::len).unwrap_or(0)
    }

    #[cfg(test)]
    fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }
}
