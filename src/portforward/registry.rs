//! Local ports currently held by forwards.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared set of reserved local ports. Cloning shares the set.
#[derive(Debug, Clone, Default)]
pub struct ForwardedPortRegistry {
    ports: Arc<Mutex<HashSet<u16>>>,
}

impl ForwardedPortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn ports(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve `port`; false if it is already reserved.
    pub fn reserve(&self, port: u16) -> bool {
        self.ports().insert(port)
    }

    pub fn release(&self, port: u16) {
        self.ports().remove(&port);
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports().contains(&port)
    }

    pub fn len(&self) -> usize {
        self.ports().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve the first port at or above `from` that is neither reserved
    /// nor bound by another process.
    pub fn allocate(&self, from: u16) -> Option<u16> {
        (from.max(1)..=u16::MAX).find(|&port| {
            if !self.reserve(port) {
                return false;
            }
            if is_port_free(port) {
                true
            } else {
                self.release(port);
                false
            }
        })
    }
}

fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
