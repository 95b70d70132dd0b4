//! Runner: one build-test-deploy cycle over the collaborators, and the dev
//! loop on top of it (see [`dev`]).

pub mod dev;

use futures::future::join_all;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::build::{merge_with_previous_builds, tagger_for, BuildResult, Builder, CustomBuilder, ImageTags, Tagger};
use crate::cache::ArtifactCache;
use crate::config::{Artifact, PipelineConfig, RunOptions};
use crate::deploy::{default_labels, CommandDeployer, DeployResult, Deployer, Labels};
use crate::docker::{DockerCli, ImageStore};
use crate::error::{DevError, Result};
use crate::event::{Event, EventBus};
use crate::kubernetes::{Cluster, ImageList, KubectlCluster};
use crate::logs::{stdout_sink, KubectlLogAggregator, LogAggregator};
use crate::portforward::{Forwarder, KubectlForwarder};
use crate::sync::{KubectlSyncer, Syncer};
use crate::test::{CommandTester, Tester};

pub use dev::Changes;

/// Everything the runner delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub builder: Arc<dyn Builder>,
    pub tagger: Arc<dyn Tagger>,
    pub tester: Arc<dyn Tester>,
    pub deployer: Arc<dyn Deployer>,
    pub syncer: Arc<dyn Syncer>,
    pub images: Arc<dyn ImageStore>,
    pub cluster: Arc<dyn Cluster>,
    pub forwarder: Arc<dyn Forwarder>,
    pub logger: Arc<dyn LogAggregator>,
}

impl Collaborators {
    /// The CLI-backed implementations: shell commands, `docker`, `kubectl`.
    pub fn from_config(
        config: &PipelineConfig,
        custom_tag: Option<&str>,
        kube_context: Option<String>,
        token: &CancellationToken,
    ) -> Self {
        let cluster: Arc<dyn Cluster> = Arc::new(KubectlCluster::new(kube_context.clone()));
        Self {
            builder: Arc::new(CustomBuilder::new(config.build.push)),
            tagger: tagger_for(&config.build.tag_policy, custom_tag),
            tester: Arc::new(CommandTester::new(&config.root, config.test.clone())),
            deployer: Arc::new(CommandDeployer::new(&config.root, config.deploy.clone())),
            syncer: Arc::new(KubectlSyncer::new(Arc::clone(&cluster), config.deploy.namespaces.clone())),
            images: Arc::new(DockerCli::new(token.clone())),
            forwarder: Arc::new(KubectlForwarder::new(kube_context.clone())),
            logger: Arc::new(KubectlLogAggregator::new(Arc::clone(&cluster), kube_context, stdout_sink())),
            cluster,
        }
    }
}

/// Drives builds, tests and deploys for one session.
pub struct Runner {
    config: PipelineConfig,
    opts: RunOptions,
    collaborators: Collaborators,
    cache: Arc<ArtifactCache>,
    image_list: ImageList,
    run_id: String,
    labels: Labels,
    events: EventBus,
    builds: Mutex<Vec<BuildResult>>,
    iteration: AtomicU64,
}

impl Runner {
    pub fn new(config: PipelineConfig, opts: RunOptions, collaborators: Collaborators, events: EventBus) -> Self {
        let cache = Arc::new(ArtifactCache::new(
            opts.cache_artifacts,
            config.build.push,
            &opts.cache_file,
            Arc::clone(&collaborators.builder),
            Arc::clone(&collaborators.images),
        ));
        let run_id = uuid::Uuid::new_v4().to_string();
        let labels = default_labels(&run_id);
        Self {
            config,
            opts,
            collaborators,
            cache,
            image_list: ImageList::new(),
            run_id,
            labels,
            events,
            builds: Mutex::new(Vec::new()),
            iteration: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn options(&self) -> &RunOptions {
        &self.opts
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn image_list(&self) -> &ImageList {
        &self.image_list
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Latest build result per image.
    pub fn builds(&self) -> Vec<BuildResult> {
        self.lock_builds().clone()
    }

    fn lock_builds(&self) -> MutexGuard<'_, Vec<BuildResult>> {
        self.builds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_iteration(&self) -> u64 {
        self.iteration.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Build, test and deploy every configured artifact once.
    pub async fn run(&self, token: &CancellationToken) -> Result<DeployResult> {
        let artifacts = self.config.build.artifacts.clone();
        let iteration = self.next_iteration();
        self.events.publish(Event::DevLoopStarted { iteration });
        match self.build_test_deploy(token, &artifacts).await {
            Ok(result) => {
                self.events.publish(Event::DevLoopCompleted { iteration });
                Ok(result)
            }
            Err(e) => {
                self.events.publish(Event::DevLoopFailed {
                    iteration,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Build and test `artifacts`, then deploy everything built so far.
    pub async fn build_test_deploy(
        &self,
        token: &CancellationToken,
        artifacts: &[Artifact],
    ) -> Result<DeployResult> {
        let results = self.build_and_test(token, artifacts).await?;
        {
            let mut builds = self.lock_builds();
            let merged = merge_with_previous_builds(&results, &builds);
            *builds = merged;
        }
        self.deploy(token).await
    }

    /// Tag, consult the cache, build what is missing, then test.
    pub async fn build_and_test(
        &self,
        token: &CancellationToken,
        artifacts: &[Artifact],
    ) -> Result<Vec<BuildResult>> {
        let tags = self.image_tags(artifacts).await?;

        let lookup = self.cache.lookup(&tags, artifacts).await;
        for cached in &lookup.already_built {
            self.events.publish(Event::BuildCached {
                artifact: cached.image_name.clone(),
                tag: cached.tag.clone(),
            });
        }

        let mut results = lookup.already_built;
        if !lookup.need_build.is_empty() {
            for artifact in &lookup.need_build {
                self.events.publish(Event::BuildStarted {
                    artifact: artifact.image_name.clone(),
                });
            }
            let built = match self.collaborators.builder.build(token, &tags, &lookup.need_build).await {
                Ok(built) => built,
                Err(e) => {
                    for artifact in &lookup.need_build {
                        self.events.publish(Event::BuildFailed {
                            artifact: artifact.image_name.clone(),
                            error: e.to_string(),
                        });
                    }
                    return Err(e);
                }
            };
            for result in &built {
                self.events.publish(Event::BuildCompleted {
                    artifact: result.image_name.clone(),
                    tag: result.tag.clone(),
                });
            }
            if let Err(e) = self.cache.store(artifacts, &built, &lookup.hashes).await {
                warn!(error = %e, "error caching artifacts");
            }
            results.extend(built);
        }

        for result in &results {
            self.image_list.add(result.tag.clone());
        }

        if !self.opts.skip_tests {
            self.events.publish(Event::TestStarted);
            if let Err(e) = self.collaborators.tester.test(token, &results).await {
                self.events.publish(Event::TestFailed { error: e.to_string() });
                return Err(e);
            }
            self.events.publish(Event::TestCompleted);
        }
        Ok(results)
    }

    /// Deploy every known build.
    pub async fn deploy(&self, token: &CancellationToken) -> Result<DeployResult> {
        let builds = self.builds();
        self.events.publish(Event::DeployStarted);
        match self.collaborators.deployer.deploy(token, &builds, &self.labels).await {
            Ok(result) => {
                self.events.publish(Event::DeployCompleted {
                    namespaces: result.namespaces.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                self.events.publish(Event::DeployFailed { error: e.to_string() });
                Err(e)
            }
        }
    }

    /// Tags for every artifact, generated concurrently. One failing tagger
    /// fails the whole call.
    async fn image_tags(&self, artifacts: &[Artifact]) -> Result<ImageTags> {
        let workspace: PathBuf = self.config.root.clone();
        let jobs = artifacts.iter().map(|artifact| {
            let tagger = Arc::clone(&self.collaborators.tagger);
            let workspace = workspace.clone();
            let image_name = artifact.image_name.clone();
            async move {
                let name = image_name.clone();
                let tag = tokio::task::spawn_blocking(move || {
                    tagger.generate_fully_qualified_image_name(&workspace, &image_name)
                })
                .await
                .map_err(|e| DevError::Tag {
                    image: name.clone(),
                    message: e.to_string(),
                })?;
                tag.map(|tag| (name, tag))
            }
        });

        let mut tags = ImageTags::new();
        for outcome in join_all(jobs).await {
            let (name, tag) = outcome?;
            info!(artifact = %name, tag = %tag, "generated tag");
            tags.insert(name, tag);
        }
        Ok(tags)
    }
}
