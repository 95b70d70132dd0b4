//! Cluster model and the capability the port forwarder and log tailer use.
//!
//! Only the handful of pod and service fields the dev loop reads are
//! modelled; everything else in the API objects is ignored on parse.

pub mod kubectl;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use kubectl::KubectlCluster;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub deletion_timestamp: Option<String>,
}

impl ObjectMeta {
    /// Resource version as a generation number. Kubernetes treats it as
    /// opaque; an unparsable value counts as generation 0.
    pub fn generation(&self) -> u64 {
        self.resource_version.parse().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(default)]
    pub name: Option<String>,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// Running and not being torn down.
    pub fn is_forwardable(&self) -> bool {
        self.status.phase == "Running" && self.metadata.deletion_timestamp.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

/// `kubectl get -o json` list envelope.
#[derive(Debug, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// One entry of a pod watch stream (`--output-watch-events`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
    Bookmark(serde_json::Value),
    Error(serde_json::Value),
}

/// Decides which pods the dev loop cares about.
pub trait PodSelector: Send + Sync {
    fn select(&self, pod: &Pod) -> bool;
}

/// Selects pods running an image built in this session.
#[derive(Debug, Clone, Default)]
pub struct ImageList {
    names: Arc<RwLock<HashSet<String>>>,
}

impl ImageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, image: impl Into<String>) {
        self.names
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(image.into());
    }

    pub fn len(&self) -> usize {
        self.names.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PodSelector for ImageList {
    fn select(&self, pod: &Pod) -> bool {
        let names = self.names.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        pod.spec.containers.iter().any(|c| names.contains(&c.image))
    }
}

/// Cluster operations, so the dev loop can run against a fake in tests.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Stream pod events for `namespaces` until `token` is cancelled.
    async fn watch_pods(
        &self,
        namespaces: &[String],
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<PodEvent>>;

    async fn list_services(&self, namespaces: &[String], label: &str) -> Result<Vec<Service>>;

    async fn list_pods(&self, namespaces: &[String]) -> Result<Vec<Pod>>;
}
