//! Dev loop events and the session state folded from them.
//!
//! Every state change the loop goes through is published as an [`Event`]
//! on a broadcast bus. The bus also keeps a [`SessionState`] snapshot that
//! the control socket serves to `devloop status`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    DevLoopStarted { iteration: u64 },
    DevLoopCompleted { iteration: u64 },
    DevLoopFailed { iteration: u64, error: String },
    FilesChanged { count: usize },
    BuildStarted { artifact: String },
    BuildCached { artifact: String, tag: String },
    BuildCompleted { artifact: String, tag: String },
    BuildFailed { artifact: String, error: String },
    TestStarted,
    TestCompleted,
    TestFailed { error: String },
    DeployStarted,
    DeployCompleted { namespaces: Vec<String> },
    DeployFailed { error: String },
    SyncStarted { image: String, files: usize },
    SyncCompleted { image: String },
    SyncFailed { image: String, error: String },
    #[serde(rename_all = "camelCase")]
    PortForwarded {
        resource: String,
        local_port: u16,
        remote_port: u16,
        pod_name: String,
        container_name: String,
    },
    ConfigurationChanged,
}

/// An event with the time it was published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    InProgress,
    Cached,
    Complete,
    Failed,
}

/// What a status query reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub iteration: u64,
    pub builds: BTreeMap<String, Phase>,
    pub tags: BTreeMap<String, String>,
    pub test: Option<Phase>,
    pub deploy: Option<Phase>,
    pub syncs: BTreeMap<String, Phase>,
    /// resource -> local port
    pub forwarded: BTreeMap<String, u16>,
    pub last_error: Option<String>,
    pub reload_pending: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn apply(&mut self, envelope: &Envelope) {
        self.updated_at = Some(envelope.timestamp);
        match &envelope.event {
            Event::DevLoopStarted { iteration } => {
                self.iteration = *iteration;
                self.last_error = None;
            }
            Event::DevLoopCompleted { iteration } => self.iteration = *iteration,
            Event::DevLoopFailed { iteration, error } => {
                self.iteration = *iteration;
                self.last_error = Some(error.clone());
            }
            Event::FilesChanged { .. } => {}
            Event::BuildStarted { artifact } => {
                self.builds.insert(artifact.clone(), Phase::InProgress);
            }
            Event::BuildCached { artifact, tag } => {
                self.builds.insert(artifact.clone(), Phase::Cached);
                self.tags.insert(artifact.clone(), tag.clone());
            }
            Event::BuildCompleted { artifact, tag } => {
                self.builds.insert(artifact.clone(), Phase::Complete);
                self.tags.insert(artifact.clone(), tag.clone());
            }
            Event::BuildFailed { artifact, error } => {
                self.builds.insert(artifact.clone(), Phase::Failed);
                self.last_error = Some(error.clone());
            }
            Event::TestStarted => self.test = Some(Phase::InProgress),
            Event::TestCompleted => self.test = Some(Phase::Complete),
            Event::TestFailed { error } => {
                self.test = Some(Phase::Failed);
                self.last_error = Some(error.clone());
            }
            Event::DeployStarted => self.deploy = Some(Phase::InProgress),
            Event::DeployCompleted { .. } => self.deploy = Some(Phase::Complete),
            Event::DeployFailed { error } => {
                self.deploy = Some(Phase::Failed);
                self.last_error = Some(error.clone());
            }
            Event::SyncStarted { image, .. } => {
                self.syncs.insert(image.clone(), Phase::InProgress);
            }
            Event::SyncCompleted { image } => {
                self.syncs.insert(image.clone(), Phase::Complete);
            }
            Event::SyncFailed { image, error } => {
                self.syncs.insert(image.clone(), Phase::Failed);
                self.last_error = Some(error.clone());
            }
            Event::PortForwarded { resource, local_port, .. } => {
                self.forwarded.insert(resource.clone(), *local_port);
            }
            Event::ConfigurationChanged => self.reload_pending = true,
        }
    }
}

/// Broadcast bus; clones share subscribers and state.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
    state: Arc<Mutex<SessionState>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn publish(&self, event: Event) {
        let envelope = Envelope {
            timestamp: Utc::now(),
            event,
        };
        self.lock_state().apply(&envelope);
        // No subscribers is fine.
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_folds_events() {
        let bus = EventBus::default();
        bus.publish(Event::DevLoopStarted { iteration: 1 });
        bus.publish(Event::BuildStarted { artifact: "web".into() });
        bus.publish(Event::BuildFailed {
            artifact: "web".into(),
            error: "boom".into(),
        });
        bus.publish(Event::BuildCached {
            artifact: "api".into(),
            tag: "api:v1".into(),
        });

        let state = bus.state();
        assert_eq!(state.iteration, 1);
        assert_eq!(state.builds["web"], Phase::Failed);
        assert_eq!(state.builds["api"], Phase::Cached);
        assert_eq!(state.tags["api"], "api:v1");
        assert_eq!(state.last_error.as_deref(), Some("boom"));

        bus.publish(Event::DevLoopStarted { iteration: 2 });
        assert_eq!(bus.state().last_error, None);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Event::DeployCompleted {
            namespaces: vec!["default".into()],
        });
        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, Event::DeployCompleted { .. }));
        assert_eq!(bus.state().deploy, Some(Phase::Complete));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(Event::PortForwarded {
            resource: "service/web".into(),
            local_port: 9000,
            remote_port: 80,
            pod_name: String::new(),
            container_name: String::new(),
        })
        .unwrap();
        assert_eq!(json["event"], "portForwarded");
        assert_eq!(json["localPort"], 9000);
    }
}
