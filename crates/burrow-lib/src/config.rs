//! Broker configuration

use burrow_proto::{DEFAULT_BUFFER_SIZE, DEFAULT_PORT_END, DEFAULT_PORT_START};
use burrow_server_tcp::PublicListenerConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// First port handed out for public and rendezvous listeners. Port 0
    /// is never handed out; a zero bound counts as 1.
    pub port_range_start: u16,
    /// Last port (inclusive)
    pub port_range_end: u16,
    pub bind_ip: IpAddr,
    pub buffer_size: usize,
    pub rendezvous_timeout: Duration,
    /// Age after which a never-activated request is dropped. `None` keeps
    /// pending requests until they are activated.
    pub pending_ttl: Option<Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port_range_start: DEFAULT_PORT_START,
            port_range_end: DEFAULT_PORT_END,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            buffer_size: DEFAULT_BUFFER_SIZE,
            rendezvous_timeout: Duration::from_secs(30),
            pending_ttl: None,
        }
    }
}

impl BrokerConfig {
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range_start = start;
        self.port_range_end = end;
        self
    }

    pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn with_rendezvous_timeout(mut self, timeout: Duration) -> Self {
        self.rendezvous_timeout = timeout;
        self
    }

    pub(crate) fn listener_config(&self) -> PublicListenerConfig {
        PublicListenerConfig {
            bind_ip: self.bind_ip,
            buffer_size: self.buffer_size,
            rendezvous_timeout: self.rendezvous_timeout,
        }
    }
}
