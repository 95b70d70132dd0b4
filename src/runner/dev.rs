//! Dev mode: watch sources, then sync, rebuild, redeploy or reload.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Runner;
use crate::build::BuildResult;
use crate::config::Artifact;
use crate::deploy::RUN_ID_LABEL;
use crate::error::{DevError, Result};
use crate::event::Event;
use crate::kubernetes::PodSelector;
use crate::portforward::PortForwardManager;
use crate::sync::{self, SyncItem};
use crate::watch::{static_lister, ChangeHandler, ChangeSet, Lister, Reconciled, Subscriber, Trigger, Watcher};

/// Work accumulated by change handlers between reconciliation passes.
#[derive(Debug, Default)]
pub struct Changes {
    pub dirty_artifacts: Vec<(Artifact, ChangeSet)>,
    pub needs_resync: Vec<SyncItem>,
    pub needs_rebuild: Vec<Artifact>,
    pub needs_redeploy: bool,
    pub needs_reload: bool,
    pub changed_files: usize,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.dirty_artifacts.is_empty()
            && self.needs_resync.is_empty()
            && self.needs_rebuild.is_empty()
            && !self.needs_redeploy
            && !self.needs_reload
    }

    fn add_rebuild(&mut self, artifact: Artifact) {
        if !self.needs_rebuild.iter().any(|a| a.image_name == artifact.image_name) {
            self.needs_rebuild.push(artifact);
        }
    }

    /// Merge work left over from a pass back in front of newer changes.
    fn absorb(&mut self, leftover: Changes) {
        for artifact in leftover.needs_rebuild {
            self.add_rebuild(artifact);
        }
        self.needs_redeploy |= leftover.needs_redeploy;
    }

    /// Split dirty artifacts into resyncs and rebuilds.
    fn classify(&mut self, builds: &[BuildResult]) {
        for (artifact, changes) in std::mem::take(&mut self.dirty_artifacts) {
            match sync::new_item(&artifact, &changes, builds) {
                Ok(Some(item)) => self.needs_resync.push(item),
                Ok(None) => self.add_rebuild(artifact),
                Err(e) => {
                    warn!(artifact = %artifact.image_name, error = %e, "cannot sync, rebuilding");
                    self.add_rebuild(artifact);
                }
            }
        }
    }
}

fn lock(changes: &Mutex<Changes>) -> MutexGuard<'_, Changes> {
    changes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Runner {
    /// Run dev mode with the trigger selected by the run options.
    ///
    /// Returns `Err(DevError::ConfigurationChanged)` when the pipeline file
    /// changed; the caller should reload it and start over.
    pub async fn dev(&self, token: &CancellationToken) -> Result<()> {
        let mut roots: Vec<PathBuf> = self
            .config
            .build
            .artifacts
            .iter()
            .map(|a| a.context.clone())
            .collect();
        roots.push(self.config.root.clone());
        roots.sort();
        roots.dedup();
        let trigger = Trigger::from_options(&self.opts, roots);
        self.dev_with_trigger(token, trigger).await
    }

    pub async fn dev_with_trigger(&self, token: &CancellationToken, trigger: Trigger) -> Result<()> {
        let changes = Arc::new(Mutex::new(Changes::default()));
        let mut watcher = Watcher::new(trigger);

        for artifact in &self.config.build.artifacts {
            if !self.opts.is_target_image(artifact) {
                debug!(artifact = %artifact.image_name, "not a target image, not watching");
                continue;
            }
            let builder = Arc::clone(&self.collaborators.builder);
            let listed = artifact.clone();
            let lister: Lister = Arc::new(move || {
                let builder = Arc::clone(&builder);
                let artifact = listed.clone();
                Box::pin(async move { builder.dependencies_for_artifact(&artifact).await })
            });
            let sink = Arc::clone(&changes);
            let dirty = artifact.clone();
            watcher
                .register(
                    format!("artifact {}", artifact.image_name),
                    lister,
                    Box::new(move |set: &ChangeSet| {
                        let mut pending = lock(&sink);
                        pending.changed_files += set.len();
                        pending.dirty_artifacts.push((dirty.clone(), set.clone()));
                    }),
                )
                .await?;
        }

        let tester = Arc::clone(&self.collaborators.tester);
        let lister: Lister = Arc::new(move || {
            let tester = Arc::clone(&tester);
            Box::pin(async move { tester.dependencies().await })
        });
        watcher
            .register("test dependencies", lister, redeploy_handler(&changes))
            .await?;

        let deployer = Arc::clone(&self.collaborators.deployer);
        let lister: Lister = Arc::new(move || {
            let deployer = Arc::clone(&deployer);
            Box::pin(async move { deployer.dependencies().await })
        });
        watcher
            .register("deploy dependencies", lister, redeploy_handler(&changes))
            .await?;

        let sink = Arc::clone(&changes);
        watcher
            .register(
                "pipeline config",
                static_lister(vec![self.opts.config_file.clone()]),
                Box::new(move |set: &ChangeSet| {
                    let mut pending = lock(&sink);
                    pending.changed_files += set.len();
                    pending.needs_reload = true;
                }),
            )
            .await?;

        let cache: Arc<dyn Subscriber> = self.cache.clone();
        watcher.subscribe(cache);

        // Nothing useful can be watched without a first deployment.
        self.run(token).await?;

        let namespaces = self.config.deploy.namespaces.clone();
        let selector: Arc<dyn PodSelector> = Arc::new(self.image_list.clone());
        if self.opts.tail {
            if let Err(e) = self
                .collaborators
                .logger
                .start(token, Arc::clone(&selector), &namespaces)
                .await
            {
                warn!(error = %e, "cannot stream logs");
            }
        }

        let forwarding = if self.opts.port_forward {
            let manager = PortForwardManager::new(
                Arc::clone(&self.collaborators.cluster),
                Arc::clone(&self.collaborators.forwarder),
                selector,
                self.events.clone(),
            )
            .with_namespaces(namespaces)
            .with_label(format!("{}={}", RUN_ID_LABEL, self.run_id))
            .with_resources(self.config.port_forward.clone());
            match manager.start(token).await {
                Ok(()) => Some(manager),
                Err(e) => {
                    warn!(error = %e, "cannot start port forwarding");
                    None
                }
            }
        } else {
            None
        };

        let pending: &Mutex<Changes> = &changes;
        let outcome = watcher
            .run(token.clone(), move || self.reconcile(token, pending))
            .await;

        if let Some(manager) = forwarding {
            manager.stop().await;
        }
        if self.opts.tail {
            self.collaborators.logger.stop().await;
        }
        outcome
    }

    /// One reconciliation pass. Only the highest-priority category runs:
    /// reload, then resync, then rebuild, then redeploy.
    async fn reconcile(&self, token: &CancellationToken, changes: &Mutex<Changes>) -> Result<Reconciled> {
        let mut pass = std::mem::take(&mut *lock(changes));
        pass.classify(&self.builds());

        if pass.changed_files > 0 {
            self.events.publish(Event::FilesChanged {
                count: pass.changed_files,
            });
        }

        if pass.needs_reload {
            info!("pipeline config changed, reloading");
            self.events.publish(Event::ConfigurationChanged);
            return Err(DevError::ConfigurationChanged);
        }
        if pass.is_empty() {
            return Ok(Reconciled::Done);
        }

        let iteration = self.next_iteration();
        self.events.publish(Event::DevLoopStarted { iteration });
        self.collaborators.logger.mute();
        let outcome = self.apply(token, pass, changes).await;
        self.collaborators.logger.unmute();

        match outcome {
            Ok(reconciled) => {
                self.events.publish(Event::DevLoopCompleted { iteration });
                Ok(reconciled)
            }
            Err(DevError::Cancelled) => Err(DevError::Cancelled),
            Err(e) => {
                self.events.publish(Event::DevLoopFailed {
                    iteration,
                    error: e.to_string(),
                });
                // The loop stays live; the next change starts a fresh pass.
                Ok(Reconciled::Done)
            }
        }
    }

    async fn apply(
        &self,
        token: &CancellationToken,
        mut pass: Changes,
        changes: &Mutex<Changes>,
    ) -> Result<Reconciled> {
        if !pass.needs_resync.is_empty() {
            for item in std::mem::take(&mut pass.needs_resync) {
                self.events.publish(Event::SyncStarted {
                    image: item.image.clone(),
                    files: item.len(),
                });
                if let Err(e) = self.collaborators.syncer.sync(token, &item).await {
                    if e.is_cancelled() {
                        return Err(e);
                    }
                    warn!(image = %item.image, error = %e, "skipping deploy due to sync error");
                    self.events.publish(Event::SyncFailed {
                        image: item.image.clone(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
                self.events.publish(Event::SyncCompleted { image: item.image });
            }

            if pass.needs_rebuild.is_empty() && !pass.needs_redeploy {
                return Ok(Reconciled::Done);
            }
            debug!(
                rebuilds = pass.needs_rebuild.len(),
                redeploy = pass.needs_redeploy,
                "deferring lower-priority work"
            );
            lock(changes).absorb(pass);
            return Ok(Reconciled::Deferred);
        }

        if !pass.needs_rebuild.is_empty() {
            // A deploy follows every successful rebuild, covering any
            // pending redeploy as well.
            if let Err(e) = self.build_test_deploy(token, &pass.needs_rebuild).await {
                if !e.is_cancelled() {
                    warn!(error = %e, "skipping deploy due to error");
                }
                return Err(e);
            }
            return Ok(Reconciled::Done);
        }

        if pass.needs_redeploy {
            if let Err(e) = self.deploy(token).await {
                if !e.is_cancelled() {
                    warn!(error = %e, "redeploy failed");
                }
                return Err(e);
            }
        }
        Ok(Reconciled::Done)
    }
}

fn redeploy_handler(changes: &Arc<Mutex<Changes>>) -> ChangeHandler {
    let sink = Arc::clone(changes);
    Box::new(move |set: &ChangeSet| {
        let mut pending = lock(&sink);
        pending.changed_files += set.len();
        pending.needs_redeploy = true;
    })
}
