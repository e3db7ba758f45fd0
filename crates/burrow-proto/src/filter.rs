//! Blacklist / whitelist filtering of peer addresses
//!
//! A filter holds a set of textual IP addresses. Matching is exact string
//! membership against the peer's IP as rendered by `IpAddr::to_string`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// How the address list of a [`Filter`] is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterType {
    /// Listed addresses are refused, everything else is let through
    #[default]
    Blacklist,
    /// Only listed addresses are let through
    Whitelist,
}

/// Filter errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("Invalid IP address in filter: {0}")]
    InvalidIpAddress(String),
}

/// IP filter applied to every public connection of a tunnel.
///
/// The default filter is an empty blacklist, which lets every peer through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    #[serde(rename = "list", default)]
    pub addresses: BTreeSet<String>,
}

impl Filter {
    pub fn new<I, S>(filter_type: FilterType, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            filter_type,
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }

    pub fn blacklist<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(FilterType::Blacklist, addresses)
    }

    pub fn whitelist<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(FilterType::Whitelist, addresses)
    }

    /// Returns true if a peer with this address must be refused
    pub fn blocks(&self, address: &str) -> bool {
        let listed = self.addresses.contains(address);
        match self.filter_type {
            FilterType::Blacklist => listed,
            FilterType::Whitelist => !listed,
        }
    }

    /// Check that every entry is a plain IPv4 or IPv6 address.
    ///
    /// Entries are compared as text, so an entry such as `010.0.0.1` or
    /// `10.0.0.0/8` could never match a peer.
    pub fn validate(&self) -> Result<(), FilterError> {
        for entry in &self.addresses {
            let ip = IpAddr::from_str(entry)
                .map_err(|_| FilterError::InvalidIpAddress(entry.clone()))?;
            if ip.to_string() != *entry {
                return Err(FilterError::InvalidIpAddress(entry.clone()));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}
