//! Port bookkeeping shared by every tunnel
//!
//! Tracks each port held by a public listener, a pending request or a
//! rendezvous listener. All check-then-insert sequences happen under one
//! lock so two callers can never be handed the same port.

use burrow_proto::PortUsage;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace};

/// Random picks tried before falling back to a scan of the free ports
const RANDOM_ATTEMPTS: usize = 64;
/// Candidates found bound by another process before giving up
const MAX_BUSY_PROBES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortAllocatorError {
    #[error("No free port left in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("Port {0} is already in use")]
    InUse(u16),

    #[error("Port {0} is not a valid port")]
    InvalidPort(u16),
}

pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    in_use: Mutex<HashSet<u16>>,
    /// Address candidates are test-bound on, to skip ports another process
    /// already holds. `None` disables the probe.
    probe_ip: Option<IpAddr>,
}

impl PortAllocator {
    /// Create an allocator for the closed range `[range_start, range_end]`.
    ///
    /// Port 0 is never handed out: a zero bound is raised to 1.
    pub fn new(range_start: u16, range_end: u16) -> Self {
        let (range_start, range_end) = if range_start <= range_end {
            (range_start, range_end)
        } else {
            (range_end, range_start)
        };
        Self {
            range_start: range_start.max(1),
            range_end: range_end.max(1),
            in_use: Mutex::new(HashSet::new()),
            probe_ip: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        }
    }

    /// Enable or disable the OS-level bind probe on candidates
    pub fn with_os_probe(mut self, probe_os: bool) -> Self {
        self.probe_ip = probe_os.then(|| IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        self
    }

    /// Probe candidates on the address listeners will actually bind
    pub fn with_probe_ip(mut self, ip: IpAddr) -> Self {
        self.probe_ip = Some(ip);
        self
    }

    pub fn range(&self) -> (u16, u16) {
        (self.range_start, self.range_end)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        // The set stays consistent even if a holder panicked mid-operation
        self.in_use.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_port_available(ip: IpAddr, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(ip, port)).is_ok()
    }

    fn exhausted(&self) -> PortAllocatorError {
        PortAllocatorError::Exhausted {
            start: self.range_start,
            end: self.range_end,
        }
    }

    /// Pick a free port uniformly at random from the range and mark it used.
    ///
    /// With the OS probe on, a candidate is claimed first and test-bound
    /// outside the lock. Candidates another process holds stay claimed until
    /// the search ends so they are not picked twice.
    pub fn allocate(&self) -> Result<u16, PortAllocatorError> {
        let Some(probe_ip) = self.probe_ip else {
            return self.claim_free();
        };

        let mut busy = Vec::new();
        let result = loop {
            let candidate = match self.claim_free() {
                Ok(candidate) => candidate,
                Err(e) => break Err(e),
            };
            if Self::is_port_available(probe_ip, candidate) {
                break Ok(candidate);
            }
            trace!("Port {} is bound by another process", candidate);
            busy.push(candidate);
            if busy.len() >= MAX_BUSY_PROBES {
                debug!(
                    "Gave up after {} ports in {}-{} were bound elsewhere",
                    busy.len(),
                    self.range_start,
                    self.range_end
                );
                break Err(self.exhausted());
            }
        };

        if !busy.is_empty() {
            let mut in_use = self.lock();
            for port in busy {
                in_use.remove(&port);
            }
        }
        result
    }

    /// Claim a port no one in this process holds, without touching the OS
    fn claim_free(&self) -> Result<u16, PortAllocatorError> {
        let mut in_use = self.lock();

        let range_size = (self.range_end - self.range_start) as usize + 1;
        let held_in_range = in_use
            .iter()
            .filter(|p| (self.range_start..=self.range_end).contains(*p))
            .count();
        if held_in_range >= range_size {
            debug!(
                "Port range {}-{} exhausted",
                self.range_start, self.range_end
            );
            return Err(self.exhausted());
        }

        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_ATTEMPTS {
            let candidate = rng.gen_range(self.range_start..=self.range_end);
            if in_use.insert(candidate) {
                trace!("Allocated port {}", candidate);
                return Ok(candidate);
            }
        }

        let free: Vec<u16> = (self.range_start..=self.range_end)
            .filter(|p| !in_use.contains(p))
            .collect();
        match free.choose(&mut rng) {
            Some(&candidate) => {
                in_use.insert(candidate);
                trace!("Allocated port {} after scan", candidate);
                Ok(candidate)
            }
            None => Err(self.exhausted()),
        }
    }

    /// Claim a specific port. Ports outside the random range may be claimed.
    pub fn reserve(&self, port: u16) -> Result<(), PortAllocatorError> {
        if port == 0 {
            return Err(PortAllocatorError::InvalidPort(port));
        }
        let mut in_use = self.lock();
        if !in_use.insert(port) {
            return Err(PortAllocatorError::InUse(port));
        }
        trace!("Reserved port {}", port);
        Ok(())
    }

    /// Give a port back. Returns false if it was not held; never fails.
    pub fn release(&self, port: u16) -> bool {
        let released = self.lock().remove(&port);
        if released {
            trace!("Released port {}", port);
        }
        released
    }

    pub fn is_in_use(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    pub fn in_use_count(&self) -> usize {
        self.lock().len()
    }

    pub fn usage(&self) -> PortUsage {
        let mut using: Vec<u16> = self.lock().iter().copied().collect();
        using.sort_unstable();
        PortUsage {
            start: self.range_start,
            end: self.range_end,
            using,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allocate_within_range() {
        let allocator = PortAllocator::new(40000, 40010).with_os_probe(false);
        let port = allocator.allocate().unwrap();
        assert!((40000..=40010).contains(&port));
        assert!(allocator.is_in_use(port));
    }

    #[test]
    fn test_exhausted_range() {
        let allocator = PortAllocator::new(40000, 40002).with_os_probe(false);
        let mut ports: Vec<u16> = (0..3).map(|_| allocator.allocate().unwrap()).collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![40000, 40001, 40002]);
        assert_eq!(
            allocator.allocate(),
            Err(PortAllocatorError::Exhausted {
                start: 40000,
                end: 40002
            })
        );

        allocator.release(40001);
        assert_eq!(allocator.allocate().unwrap(), 40001);
    }

    #[test]
    fn test_reserve_conflict() {
        let allocator = PortAllocator::new(40000, 40010);
        allocator.reserve(40005).unwrap();
        assert_eq!(allocator.reserve(40005), Err(PortAllocatorError::InUse(40005)));
        assert_eq!(allocator.reserve(0), Err(PortAllocatorError::InvalidPort(0)));
        // Outside the random range is allowed
        allocator.reserve(8081).unwrap();
        assert!(allocator.is_in_use(8081));
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = PortAllocator::new(40000, 40010).with_os_probe(false);
        let port = allocator.allocate().unwrap();
        assert!(allocator.release(port));
        assert!(!allocator.release(port));
        assert!(!allocator.is_in_use(port));
        assert_eq!(allocator.in_use_count(), 0);
    }

    #[test]
    fn test_reserved_ports_not_allocated() {
        let allocator = PortAllocator::new(40000, 40001).with_os_probe(false);
        allocator.reserve(40000).unwrap();
        assert_eq!(allocator.allocate().unwrap(), 40001);
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_usage_sorted() {
        let allocator = PortAllocator::new(40000, 40010);
        allocator.reserve(40009).unwrap();
        allocator.reserve(40001).unwrap();
        let usage = allocator.usage();
        assert_eq!(usage.start, 40000);
        assert_eq!(usage.end, 40010);
        assert_eq!(usage.using, vec![40001, 40009]);
    }

    #[test]
    fn test_reversed_range_is_normalized() {
        let allocator = PortAllocator::new(40010, 40000);
        assert_eq!(allocator.range(), (40000, 40010));
    }

    #[test]
    fn test_port_zero_is_never_allocated() {
        let allocator = PortAllocator::new(0, 3).with_os_probe(false);
        assert_eq!(allocator.range(), (1, 3));
        let mut ports: Vec<u16> = (0..3).map(|_| allocator.allocate().unwrap()).collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![1, 2, 3]);
        assert!(allocator.allocate().is_err());

        assert_eq!(PortAllocator::new(0, 0).range(), (1, 1));
    }

    #[test]
    fn test_allocate_skips_ports_bound_elsewhere() {
        let holder = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = holder.local_addr().unwrap().port();

        let allocator =
            PortAllocator::new(port, port).with_probe_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(
            allocator.allocate(),
            Err(PortAllocatorError::Exhausted {
                start: port,
                end: port
            })
        );
        // The busy candidate is not left claimed
        assert_eq!(allocator.in_use_count(), 0);

        drop(holder);
        assert_eq!(allocator.allocate().unwrap(), port);
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let allocator = Arc::new(PortAllocator::new(41000, 41199).with_os_probe(false));
        let held = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                let held = held.clone();
                std::thread::spawn(move || {
                    for round in 0..200 {
                        let Ok(port) = allocator.allocate() else {
                            continue;
                        };
                        assert!(
                            held.lock().unwrap().insert(port),
                            "port {} handed out twice",
                            port
                        );
                        if round % 2 == 0 {
                            held.lock().unwrap().remove(&port);
                            allocator.release(port);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(allocator.in_use_count(), held.lock().unwrap().len());
    }
}
