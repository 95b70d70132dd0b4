//! One forwarded resource.

use std::fmt;
use tokio_util::sync::CancellationToken;

/// Logical identity of a forward. Pod replacement under the same key is an
/// update of the entry, not a new forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub resource_type: String,
    pub name: String,
    pub namespace: String,
    pub port: u16,
}

impl ResourceKey {
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            namespace: namespace.into(),
            port,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}):{}", self.resource_type, self.name, self.namespace, self.port)
    }
}

/// A forward of one resource generation to a local port.
#[derive(Debug, Clone)]
pub struct PortForwardEntry {
    pub key: ResourceKey,
    pub resource_version: u64,
    pub local_port: u16,
    pub pod_name: String,
    pub container_name: String,
    pub port_name: String,
    cancel: CancellationToken,
}

impl PortForwardEntry {
    pub fn new(key: ResourceKey, resource_version: u64, local_port: u16, cancel: CancellationToken) -> Self {
        Self {
            key,
            resource_version,
            local_port,
            pod_name: String::new(),
            container_name: String::new(),
            port_name: String::new(),
            cancel,
        }
    }

    /// Cancelled when the entry is terminated or the manager stops.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop the tunnel. Safe to call more than once.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
