//! Port-forward manager.
//!
//! A coordinating task owns the table of forwarded resources and reacts to
//! pod events and the initial service sweep. Each forward runs in its own
//! task, so one resource that never becomes reachable cannot hold up the
//! others.
//!
//! ```text
//!   services (label sweep) ─┐
//!   user-declared resources ├─► coordinator ─► ForwardTable ─► tunnel task per entry
//!   pod watch events ───────┘                      │
//!                                                  └─ ForwardedPortRegistry (shared)
//! ```

pub mod entry;
pub mod kubectl;
pub mod registry;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PortForwardResource;
use crate::error::{DevError, Result};
use crate::event::{Event, EventBus};
use crate::kubernetes::{Cluster, Pod, PodEvent, PodSelector, Service};
use crate::retry::{self, RetryPolicy};

pub use entry::{PortForwardEntry, ResourceKey};
pub use kubectl::KubectlForwarder;
pub use registry::ForwardedPortRegistry;

/// Opens one tunnel for an entry.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Establish the tunnel. It must stay up until `entry.token()` is
    /// cancelled.
    async fn forward(&self, entry: &PortForwardEntry) -> Result<()>;
}

/// Forwarded resources by key. Only the coordinating task mutates it.
#[derive(Debug)]
pub struct ForwardTable {
    entries: HashMap<ResourceKey, PortForwardEntry>,
    registry: ForwardedPortRegistry,
    parent: CancellationToken,
}

impl ForwardTable {
    pub fn new(registry: ForwardedPortRegistry, parent: CancellationToken) -> Self {
        Self {
            entries: HashMap::new(),
            registry,
            parent,
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&PortForwardEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A fresh entry for `key`. The local port of an existing entry is
    /// reused; otherwise the first free port at or above `preferred` (or
    /// the remote port) is reserved.
    pub fn get_or_create_entry(
        &mut self,
        key: ResourceKey,
        resource_version: u64,
        preferred: Option<u16>,
    ) -> Result<PortForwardEntry> {
        let local_port = match self.entries.get(&key) {
            Some(existing) => existing.local_port,
            None => self
                .registry
                .allocate(preferred.unwrap_or(key.port))
                .ok_or_else(|| DevError::PortForward {
                    resource: key.to_string(),
                    message: "no free local port".to_string(),
                })?,
        };
        Ok(PortForwardEntry::new(key, resource_version, local_port, self.parent.child_token()))
    }

    /// Record `entry`, terminating an older generation under the same key.
    /// Returns false, leaving the table untouched, when the current entry
    /// is the same or a newer generation.
    pub fn record(&mut self, entry: PortForwardEntry) -> bool {
        if let Some(previous) = self.entries.get(&entry.key) {
            if entry.resource_version <= previous.resource_version {
                return false;
            }
            debug!(resource = %entry.key, old = previous.resource_version, new = entry.resource_version, "replacing forward");
            previous.terminate();
        }
        self.entries.insert(entry.key.clone(), entry);
        true
    }

    /// Drop one entry and free its port.
    pub fn terminate(&mut self, key: &ResourceKey) {
        if let Some(entry) = self.entries.remove(key) {
            entry.terminate();
            self.registry.release(entry.local_port);
        }
    }

    /// Terminate everything.
    pub fn stop(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.terminate();
            self.registry.release(entry.local_port);
        }
    }
}

/// Open the tunnel, retrying until it is reachable or the budget is spent.
pub async fn forward_with_retry(
    forwarder: Arc<dyn Forwarder>,
    entry: PortForwardEntry,
    policy: RetryPolicy,
) -> Result<()> {
    let token = entry.token().clone();
    retry::poll_immediate(policy, &token, || {
        let forwarder = Arc::clone(&forwarder);
        let entry = entry.clone();
        async move {
            match forwarder.forward(&entry).await {
                Ok(()) => Ok(true),
                Err(DevError::Cancelled) => Err(DevError::Cancelled),
                Err(e) => {
                    debug!(resource = %entry.key, error = %e, "port forward not ready");
                    Ok(false)
                }
            }
        }
    })
    .await
}

/// Details of the container port behind a pod entry.
#[derive(Debug, Default)]
struct Origin {
    pod_name: String,
    container_name: String,
    port_name: String,
}

struct Coordinator {
    table: ForwardTable,
    forwarder: Arc<dyn Forwarder>,
    selector: Arc<dyn PodSelector>,
    retry: RetryPolicy,
    events: EventBus,
}

impl Coordinator {
    async fn run(
        mut self,
        token: CancellationToken,
        services: Vec<Service>,
        declared: Vec<PortForwardResource>,
        mut pods: mpsc::Receiver<PodEvent>,
    ) {
        for service in &services {
            for port in &service.spec.ports {
                let key = ResourceKey::new("service", &service.metadata.name, &service.metadata.namespace, port.port);
                self.observe(key, service.metadata.generation(), None, Origin::default());
            }
        }
        for resource in &declared {
            let key = ResourceKey::new(
                &resource.resource_type,
                &resource.resource_name,
                &resource.namespace,
                resource.port,
            );
            self.observe(key, 0, resource.local_port, Origin::default());
        }

        let mut watching = true;
        while watching {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = pods.recv() => match event {
                    Some(PodEvent::Added(pod)) | Some(PodEvent::Modified(pod)) => self.forward_pod(&pod),
                    Some(PodEvent::Deleted(pod)) => self.forget_pod(&pod),
                    Some(PodEvent::Bookmark(_)) => {}
                    Some(PodEvent::Error(status)) => warn!(status = %status, "pod watch error"),
                    None => watching = false,
                },
            }
        }
        if !token.is_cancelled() {
            // Pod watch ended; keep existing forwards until stopped.
            debug!("pod watch closed");
            token.cancelled().await;
        }
        self.table.stop();
    }

    fn forward_pod(&mut self, pod: &Pod) {
        if !pod.is_forwardable() || !self.selector.select(pod) {
            return;
        }
        for container in &pod.spec.containers {
            for port in &container.ports {
                let key = ResourceKey::new("pod", &pod.metadata.name, &pod.metadata.namespace, port.container_port);
                let origin = Origin {
                    pod_name: pod.metadata.name.clone(),
                    container_name: container.name.clone(),
                    port_name: port.name.clone().unwrap_or_default(),
                };
                self.observe(key, pod.metadata.generation(), None, origin);
            }
        }
    }

    /// A deleted pod's replacement has a new name, so its forwards and
    /// ports are released rather than kept for reuse.
    fn forget_pod(&mut self, pod: &Pod) {
        for container in &pod.spec.containers {
            for port in &container.ports {
                let key = ResourceKey::new("pod", &pod.metadata.name, &pod.metadata.namespace, port.container_port);
                if self.table.get(&key).is_some() {
                    debug!(resource = %key, "pod deleted, dropping forward");
                    self.table.terminate(&key);
                }
            }
        }
    }

    fn observe(&mut self, key: ResourceKey, version: u64, preferred: Option<u16>, origin: Origin) {
        if matches!(self.table.get(&key), Some(current) if current.resource_version >= version) {
            return;
        }
        let mut entry = match self.table.get_or_create_entry(key, version, preferred) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "cannot forward");
                return;
            }
        };
        entry.pod_name = origin.pod_name;
        entry.container_name = origin.container_name;
        entry.port_name = origin.port_name;
        if !self.table.record(entry.clone()) {
            return;
        }

        if entry.local_port != entry.key.port {
            info!(resource = %entry.key, local_port = entry.local_port, "remote port busy locally, using another");
        }
        info!(resource = %entry.key, local_port = entry.local_port, "port forwarding");

        let forwarder = Arc::clone(&self.forwarder);
        let events = self.events.clone();
        let policy = self.retry;
        tokio::spawn(async move {
            match forward_with_retry(forwarder, entry.clone(), policy).await {
                Ok(()) => events.publish(Event::PortForwarded {
                    resource: entry.key.to_string(),
                    local_port: entry.local_port,
                    remote_port: entry.key.port,
                    pod_name: entry.pod_name.clone(),
                    container_name: entry.container_name.clone(),
                }),
                Err(DevError::Cancelled) => {}
                Err(e) => warn!(resource = %entry.key, error = %e, "giving up on port forward"),
            }
        });
    }
}

/// Starts and stops forwarding for a dev session.
pub struct PortForwardManager {
    cluster: Arc<dyn Cluster>,
    forwarder: Arc<dyn Forwarder>,
    selector: Arc<dyn PodSelector>,
    namespaces: Vec<String>,
    label: String,
    declared: Vec<PortForwardResource>,
    retry: RetryPolicy,
    registry: ForwardedPortRegistry,
    events: EventBus,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PortForwardManager {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        forwarder: Arc<dyn Forwarder>,
        selector: Arc<dyn PodSelector>,
        events: EventBus,
    ) -> Self {
        Self {
            cluster,
            forwarder,
            selector,
            namespaces: vec!["default".to_string()],
            label: String::new(),
            declared: Vec::new(),
            retry: RetryPolicy::default(),
            registry: ForwardedPortRegistry::new(),
            events,
            running: Mutex::new(None),
        }
    }

    pub fn with_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Label selector (`key=value`) for the service sweep.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_resources(mut self, declared: Vec<PortForwardResource>) -> Self {
        self.declared = declared;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &ForwardedPortRegistry {
        &self.registry
    }

    /// Sweep services, forward declared resources, then follow pod events
    /// until [`stop`](Self::stop) or cancellation of `token`.
    pub async fn start(&self, token: &CancellationToken) -> Result<()> {
        self.stop().await;
        let token = token.child_token();

        let services = if self.label.is_empty() {
            Vec::new()
        } else {
            self.cluster
                .list_services(&self.namespaces, &self.label)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "listing services failed");
                    Vec::new()
                })
        };
        let pods = self.cluster.watch_pods(&self.namespaces, token.clone()).await?;

        let coordinator = Coordinator {
            table: ForwardTable::new(self.registry.clone(), token.clone()),
            forwarder: Arc::clone(&self.forwarder),
            selector: Arc::clone(&self.selector),
            retry: self.retry,
            events: self.events.clone(),
        };
        let handle = tokio::spawn(coordinator.run(token.clone(), services, self.declared.clone(), pods));
        *self.running.lock().unwrap_or_else(|p| p.into_inner()) = Some((token, handle));
        Ok(())
    }

    /// Terminate every forward and release its port.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "port forward coordinator panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubernetes::{Container, ContainerPort, ImageList, ObjectMeta, PodSpec, PodStatus, ServicePort, ServiceSpec};
    use std::collections::HashSet;
    use std::time::Duration;

    const FAST: RetryPolicy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(50));

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("pod", name, "default", 47000)
    }

    #[test]
    fn test_newer_generation_replaces_and_keeps_port() {
        let mut table = ForwardTable::new(ForwardedPortRegistry::new(), CancellationToken::new());
        let first = table.get_or_create_entry(key("web"), 1, None).unwrap();
        assert!(table.record(first.clone()));

        let second = table.get_or_create_entry(key("web"), 2, None).unwrap();
        assert_eq!(second.local_port, first.local_port);
        assert!(table.record(second.clone()));
        assert!(first.is_terminated());
        assert!(!second.is_terminated());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_or_older_generation_is_ignored() {
        let mut table = ForwardTable::new(ForwardedPortRegistry::new(), CancellationToken::new());
        let current = table.get_or_create_entry(key("web"), 5, None).unwrap();
        assert!(table.record(current.clone()));

        let same = table.get_or_create_entry(key("web"), 5, None).unwrap();
        assert!(!table.record(same));
        let older = table.get_or_create_entry(key("web"), 3, None).unwrap();
        assert!(!table.record(older));
        assert!(!current.is_terminated());
        assert_eq!(table.get(&key("web")).unwrap().resource_version, 5);
    }

    #[test]
    fn test_active_entries_hold_distinct_ports() {
        let registry = ForwardedPortRegistry::new();
        let mut table = ForwardTable::new(registry.clone(), CancellationToken::new());
        for name in ["a", "b", "c", "d"] {
            let entry = table.get_or_create_entry(key(name), 1, None).unwrap();
            assert!(table.record(entry));
        }
        let ports: HashSet<u16> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| table.get(&key(n)).unwrap().local_port)
            .collect();
        assert_eq!(ports.len(), 4);

        table.stop();
        assert!(table.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_terminate_releases_port() {
        let registry = ForwardedPortRegistry::new();
        let mut table = ForwardTable::new(registry.clone(), CancellationToken::new());
        let entry = table.get_or_create_entry(key("web"), 1, None).unwrap();
        let port = entry.local_port;
        table.record(entry.clone());
        table.terminate(&key("web"));
        assert!(entry.is_terminated());
        assert!(!registry.contains(port));
        table.terminate(&key("web"));
    }

    /// Records every forward and reports it on a channel.
    struct FakeForwarder {
        calls: mpsc::UnboundedSender<PortForwardEntry>,
        fail: bool,
    }

    #[async_trait]
    impl Forwarder for FakeForwarder {
        async fn forward(&self, entry: &PortForwardEntry) -> Result<()> {
            let _ = self.calls.send(entry.clone());
            if self.fail {
                Err(DevError::PortForward {
                    resource: entry.key.to_string(),
                    message: "refused".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct FakeCluster {
        pods: Mutex<Option<mpsc::Receiver<PodEvent>>>,
        services: Vec<Service>,
    }

    #[async_trait]
    impl Cluster for FakeCluster {
        async fn watch_pods(&self, _namespaces: &[String], _token: CancellationToken) -> Result<mpsc::Receiver<PodEvent>> {
            self.pods
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| DevError::Cluster("already watching".to_string()))
        }

        async fn list_services(&self, _namespaces: &[String], _label: &str) -> Result<Vec<Service>> {
            Ok(self.services.clone())
        }

        async fn list_pods(&self, _namespaces: &[String]) -> Result<Vec<Pod>> {
            Ok(Vec::new())
        }
    }

    fn pod(name: &str, version: u64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                resource_version: version.to_string(),
                ..ObjectMeta::default()
            },
            spec: PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    image: "web:v1".to_string(),
                    ports: vec![ContainerPort {
                        name: Some("http".to_string()),
                        container_port: 47100,
                        protocol: None,
                    }],
                }],
            },
            status: PodStatus {
                phase: "Running".to_string(),
            },
        }
    }

    fn service(name: &str, port: u16) -> Service {
        Service {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                resource_version: "3".to_string(),
                ..ObjectMeta::default()
            },
            spec: ServiceSpec {
                ports: vec![ServicePort {
                    name: None,
                    port,
                    protocol: None,
                }],
            },
        }
    }

    struct Harness {
        manager: PortForwardManager,
        pods: mpsc::Sender<PodEvent>,
        calls: mpsc::UnboundedReceiver<PortForwardEntry>,
        events: EventBus,
    }

    fn harness(services: Vec<Service>, fail: bool) -> Harness {
        let (pods_tx, pods_rx) = mpsc::channel(16);
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let images = ImageList::new();
        images.add("web:v1");
        let events = EventBus::default();
        let manager = PortForwardManager::new(
            Arc::new(FakeCluster {
                pods: Mutex::new(Some(pods_rx)),
                services,
            }),
            Arc::new(FakeForwarder { calls: calls_tx, fail }),
            Arc::new(images),
            events.clone(),
        )
        .with_label("devloop.dev/run-id=test")
        .with_retry(FAST);
        Harness {
            manager,
            pods: pods_tx,
            calls: calls_rx,
            events,
        }
    }

    #[tokio::test]
    async fn test_pod_replacement_reuses_local_port() {
        let mut h = harness(Vec::new(), false);
        let token = CancellationToken::new();
        h.manager.start(&token).await.unwrap();

        h.pods.send(PodEvent::Added(pod("web-0", 1))).await.unwrap();
        let first = h.calls.recv().await.unwrap();
        h.pods.send(PodEvent::Modified(pod("web-0", 2))).await.unwrap();
        let second = h.calls.recv().await.unwrap();

        assert_eq!(second.resource_version, 2);
        assert_eq!(second.local_port, first.local_port);
        assert!(first.is_terminated());
        assert_eq!(second.container_name, "app");
        assert_eq!(second.port_name, "http");

        h.manager.stop().await;
        assert!(second.is_terminated());
        assert!(h.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_pod_releases_its_port() {
        let mut h = harness(Vec::new(), false);
        let token = CancellationToken::new();
        h.manager.start(&token).await.unwrap();

        h.pods.send(PodEvent::Added(pod("web-0", 1))).await.unwrap();
        let first = h.calls.recv().await.unwrap();
        assert!(h.manager.registry().contains(first.local_port));

        h.pods.send(PodEvent::Deleted(pod("web-0", 2))).await.unwrap();
        h.pods.send(PodEvent::Added(pod("web-1", 1))).await.unwrap();
        let replacement = h.calls.recv().await.unwrap();

        assert!(first.is_terminated());
        assert_eq!(replacement.key.name, "web-1");
        assert_eq!(h.manager.registry().len(), 1);

        h.manager.stop().await;
        assert!(h.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_services_and_unselected_pods() {
        let mut h = harness(vec![service("api", 47200)], false);
        let token = CancellationToken::new();
        h.manager.start(&token).await.unwrap();

        let swept = h.calls.recv().await.unwrap();
        assert_eq!(swept.key.resource_type, "service");
        assert_eq!(swept.resource_version, 3);

        let mut other = pod("other", 1);
        other.spec.containers[0].image = "unrelated:v1".to_string();
        h.pods.send(PodEvent::Added(other)).await.unwrap();
        h.pods.send(PodEvent::Added(pod("web-0", 1))).await.unwrap();
        let next = h.calls.recv().await.unwrap();
        assert_eq!(next.key.name, "web-0");

        token.cancel();
        h.manager.stop().await;
        assert!(next.is_terminated());
    }

    #[tokio::test]
    async fn test_exhausted_retry_leaves_loop_running() {
        let mut h = harness(Vec::new(), true);
        let token = CancellationToken::new();
        h.manager.start(&token).await.unwrap();

        h.pods.send(PodEvent::Added(pod("web-0", 1))).await.unwrap();
        assert!(h.calls.recv().await.is_some());
        // Let the retry budget run out.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while h.calls.try_recv().is_ok() {}

        h.pods.send(PodEvent::Added(pod("web-1", 1))).await.unwrap();
        let next = h.calls.recv().await.unwrap();
        assert_eq!(next.key.name, "web-1");
        assert!(h.events.state().forwarded.is_empty());
        h.manager.stop().await;
    }
}
