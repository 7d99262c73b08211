// Host port allocation for service sandboxes
use campaign_common::config::PortRange;
use rand::Rng;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

/// No free port could be found; the host cannot take more runs
#[derive(Debug, Clone, Error)]
#[error("could not find a free TCP port in {start}..{end} after {probes} probes")]
pub struct PortAllocationExhausted {
    pub start: u16,
    pub end: u16,
    pub probes: u32,
}

/// A port is free when nothing on the host holds it
fn bind_probe(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Random-probe port allocator.
///
/// Ports handed out stay reserved in-process until their lease drops, so two
/// runs of this process never share a port. Nothing is held at the OS level
/// between the probe and the sandbox's own bind: another process can still
/// take the port in that window.
pub struct PortAllocator {
    range: PortRange,
    probe: fn(u16) -> bool,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Arc<Self> {
        Self::with_probe(range, bind_probe)
    }

    pub fn with_probe(range: PortRange, probe: fn(u16) -> bool) -> Arc<Self> {
        Arc::new(Self {
            range,
            probe,
            reserved: Mutex::new(HashSet::new()),
        })
    }

    pub fn allocate(self: &Arc<Self>) -> Result<PortLease, PortAllocationExhausted> {
        let mut rng = rand::rng();

        for _ in 0..self.range.probe_budget {
            let candidate = rng.random_range(self.range.range_start..self.range.range_end);
            let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
            if reserved.contains(&candidate) || !(self.probe)(candidate) {
                continue;
            }
            reserved.insert(candidate);
            debug!(port = candidate, "Reserved host port");
            return Ok(PortLease {
                port: candidate,
                allocator: Arc::clone(self),
            });
        }

        Err(PortAllocationExhausted {
            start: self.range.range_start,
            end: self.range.range_end,
            probes: self.range.probe_budget,
        })
    }

    fn release(&self, port: u16) {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        reserved.remove(&port);
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A reserved port, released on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range", &(self.range.range_start..self.range.range_end))
            .field("reserved", &self.reserved_count())
            .finish()
    }
}
