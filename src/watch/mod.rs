//! Watcher: re-fingerprints registered components on every trigger tick
//! and fires one reconciliation pass per burst of changes.
//!
//! Each component pairs a dependency [`Lister`] with a change handler. On a
//! firing tick, handlers of all dirty components run first (so they observe
//! one consistent snapshot), then subscribers hear about the union of changed
//! paths, then the reconciliation callback runs. Dirty bookkeeping is only
//! cleared once that callback has returned.

pub mod fingerprint;
pub mod trigger;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DevError, Result};

pub use fingerprint::{capture, diff, static_lister, ChangeSet, FileFingerprint, Lister};
pub use trigger::{ManualTicks, Trigger};

/// Handler invoked with a component's changes during a firing pass.
pub type ChangeHandler = Box<dyn FnMut(&ChangeSet) + Send>;

/// Receives the union of changed paths before each reconciliation.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn files_changed(&self, paths: &[PathBuf]);
}

/// Outcome of one reconciliation callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Everything observed so far was handled.
    Done,
    /// Work is still pending; run another pass on the next tick.
    Deferred,
}

struct WatchedComponent {
    name: String,
    lister: Lister,
    on_change: ChangeHandler,
    /// Snapshot at the end of the last reconciliation pass.
    baseline: FileFingerprint,
    /// Latest snapshot.
    state: FileFingerprint,
    dirty: bool,
}

/// Watches a list of components for file changes.
pub struct Watcher {
    trigger: Trigger,
    components: Vec<WatchedComponent>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl Watcher {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            components: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// Add a component. Its dependencies must be resolvable right now.
    pub async fn register(
        &mut self,
        name: impl Into<String>,
        lister: Lister,
        on_change: ChangeHandler,
    ) -> Result<()> {
        let name = name.into();
        let state = capture(&lister)
            .await
            .map_err(|e| DevError::Registration {
                name: name.clone(),
                source: Box::new(e),
            })?;

        debug!(component = %name, files = state.len(), "registered watched component");
        self.components.push(WatchedComponent {
            name,
            lister,
            on_change,
            baseline: state.clone(),
            state,
            dirty: false,
        });
        Ok(())
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Watch until cancelled, the trigger stops, or `on_reconcile` fails.
    ///
    /// Returns `Err(DevError::Cancelled)` on cancellation and `Ok(())` when
    /// the trigger stops producing ticks.
    pub async fn run<F, Fut>(&mut self, token: CancellationToken, mut on_reconcile: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Reconciled>>,
    {
        let debounce = self.trigger.debounce();
        let mut ticks = self.trigger.start(token.child_token())?;
        let mut follow_up = false;

        info!(components = self.components.len(), debounce, "watching for changes");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DevError::Cancelled),
                tick = ticks.recv() => {
                    if tick.is_none() {
                        debug!("trigger stopped");
                        return Ok(());
                    }

                    let changed = self.scan().await;
                    let dirty = self.components.iter().any(|c| c.dirty);

                    // Rapid edits would otherwise trigger one rebuild each. A
                    // debounced trigger waits for a full tick where nothing
                    // changed, then fires for everything accumulated.
                    let fire = if debounce {
                        changed == 0 && (dirty || follow_up)
                    } else {
                        changed > 0 || follow_up
                    };
                    if !fire {
                        continue;
                    }

                    let paths = self.notify_components();
                    if !paths.is_empty() {
                        for subscriber in &self.subscribers {
                            subscriber.files_changed(&paths).await;
                        }
                    }

                    let outcome = on_reconcile().await;
                    self.settle();

                    match outcome {
                        Ok(Reconciled::Done) => follow_up = false,
                        Ok(Reconciled::Deferred) => follow_up = true,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Re-fingerprint every component; returns how many changed this tick.
    async fn scan(&mut self) -> usize {
        let mut changed = 0;
        for component in &mut self.components {
            let state = match capture(&component.lister).await {
                Ok(state) => state,
                Err(e) => {
                    // Usually a file vanished mid-scan; the next tick retries.
                    warn!(component = %component.name, error = %e, "skipping component this tick");
                    continue;
                }
            };
            if diff(&component.state, &state).has_changed() {
                component.state = state;
                component.dirty = true;
                changed += 1;
            }
        }
        changed
    }

    /// Run handlers of dirty components; returns the union of changed paths.
    fn notify_components(&mut self) -> Vec<PathBuf> {
        let mut paths = BTreeSet::new();
        for component in self.components.iter_mut().filter(|c| c.dirty) {
            let changes = diff(&component.baseline, &component.state);
            if !changes.has_changed() {
                continue;
            }
            debug!(component = %component.name, changes = changes.len(), "component changed");
            (component.on_change)(&changes);
            paths.extend(changes.paths().cloned());
        }
        paths.into_iter().collect()
    }

    fn settle(&mut self) {
        for component in self.components.iter_mut().filter(|c| c.dirty) {
            component.baseline = component.state.clone();
            component.dirty = false;
        }
    }
}
