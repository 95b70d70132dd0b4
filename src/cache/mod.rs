//! Artifact cache: skip builds whose inputs were already built.
//!
//! Each artifact is keyed by a content hash over its dependency files and
//! build configuration. A hit is only trusted once the image it points at
//! is confirmed to still exist, locally or in the registry.

pub mod hash;
pub mod persistence;

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::build::{BuildResult, Builder, ImageTags};
use crate::config::Artifact;
use crate::docker::{digest_of, ImageStore};
use crate::error::{DevError, Result};
use crate::watch::Subscriber;

pub use persistence::{ArtifactCacheMap, ImageDetails};

/// Outcome of [`ArtifactCache::lookup`].
#[derive(Debug, Default)]
pub struct Lookup {
    pub need_build: Vec<Artifact>,
    pub already_built: Vec<BuildResult>,
    /// Content hash per image name, reused by [`ArtifactCache::store`].
    pub hashes: HashMap<String, String>,
}

enum Status {
    Hit(BuildResult),
    Miss,
}

/// Content-addressed build cache shared by the runner and the watcher.
pub struct ArtifactCache {
    enabled: bool,
    push: bool,
    cache_file: PathBuf,
    entries: Mutex<ArtifactCacheMap>,
    /// Artifacts whose hash is known to be current: name -> (artifact, hash).
    valid: Mutex<HashMap<String, (Artifact, String)>>,
    builder: Arc<dyn Builder>,
    images: Arc<dyn ImageStore>,
}

impl ArtifactCache {
    /// Open the cache backed by `cache_file`. An unreadable file starts an
    /// empty cache.
    pub fn new(
        enabled: bool,
        push: bool,
        cache_file: &Path,
        builder: Arc<dyn Builder>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        let entries = if enabled {
            persistence::load(cache_file).unwrap_or_else(|e| {
                warn!(path = %cache_file.display(), error = %e, "ignoring unreadable artifact cache");
                ArtifactCacheMap::new()
            })
        } else {
            ArtifactCacheMap::new()
        };
        Self {
            enabled,
            push,
            cache_file: cache_file.to_path_buf(),
            entries: Mutex::new(entries),
            valid: Mutex::new(HashMap::new()),
            builder,
            images,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of artifacts whose hash is known to be current.
    pub fn valid_artifacts(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.valid).keys().cloned().collect();
        names.sort();
        names
    }

    /// Split `artifacts` into those that need building and those whose
    /// image already exists under the required tag (tagging or pushing a
    /// cached image if needed). Probe errors degrade one artifact to a build.
    pub async fn lookup(&self, tags: &ImageTags, artifacts: &[Artifact]) -> Lookup {
        let mut result = Lookup::default();
        if !self.enabled {
            result.need_build = artifacts.to_vec();
            return result;
        }

        let checks = artifacts.iter().map(|artifact| async move {
            let outcome = match tags.get(&artifact.image_name) {
                Some(tag) => self.check(artifact, tag).await,
                None => Err(DevError::Tag {
                    image: artifact.image_name.clone(),
                    message: "no tag generated".to_string(),
                }),
            };
            (artifact, outcome)
        });

        for (artifact, outcome) in join_all(checks).await {
            match outcome {
                Ok((Status::Hit(built), hash)) => {
                    info!(artifact = %artifact.image_name, tag = %built.tag, "found in cache");
                    result.hashes.insert(artifact.image_name.clone(), hash);
                    result.already_built.push(built);
                }
                Ok((Status::Miss, hash)) => {
                    info!(artifact = %artifact.image_name, "not found in cache, building");
                    result.hashes.insert(artifact.image_name.clone(), hash);
                    result.need_build.push(artifact.clone());
                }
                Err(e) => {
                    warn!(artifact = %artifact.image_name, error = %e, "cache check failed, building");
                    result.need_build.push(artifact.clone());
                }
            }
        }
        result
    }

    async fn check(&self, artifact: &Artifact, tag: &str) -> Result<(Status, String)> {
        let hash = self.hash_for(artifact).await?;
        let entry = lock(&self.entries).get(&hash).cloned();
        let status = match entry {
            None => Status::Miss,
            Some(entry) if self.push => self.check_remote(artifact, tag, &entry).await?,
            Some(entry) => self.check_local(artifact, tag, &entry).await?,
        };
        Ok((status, hash))
    }

    async fn check_local(&self, artifact: &Artifact, tag: &str, entry: &ImageDetails) -> Result<Status> {
        if self.images.image_id(tag).await?.as_deref() == Some(entry.image_id.as_str()) {
            return Ok(Status::Hit(result_for(artifact, tag.to_string())));
        }
        if !self.images.image_exists(&entry.image_id).await? {
            debug!(artifact = %artifact.image_name, "cached image is gone");
            return Ok(Status::Miss);
        }
        self.images.tag(&entry.image_id, tag).await?;
        Ok(Status::Hit(result_for(artifact, tag.to_string())))
    }

    async fn check_remote(&self, artifact: &Artifact, tag: &str, entry: &ImageDetails) -> Result<Status> {
        if !entry.digest.is_empty()
            && self.images.remote_digest(tag).await?.as_deref() == Some(entry.digest.as_str())
        {
            return Ok(Status::Hit(result_for(artifact, format!("{}@{}", tag, entry.digest))));
        }
        if !self.images.image_exists(&entry.image_id).await? {
            return Ok(Status::Miss);
        }
        self.images.tag(&entry.image_id, tag).await?;
        let digest = self.images.push(tag).await?;
        Ok(Status::Hit(result_for(artifact, format!("{}@{}", tag, digest))))
    }

    async fn hash_for(&self, artifact: &Artifact) -> Result<String> {
        if let Some((known, hash)) = lock(&self.valid).get(&artifact.image_name) {
            if known == artifact {
                return Ok(hash.clone());
            }
        }
        let hash = hash::artifact_hash(self.builder.as_ref(), artifact).await?;
        lock(&self.valid).insert(artifact.image_name.clone(), (artifact.clone(), hash.clone()));
        Ok(hash)
    }

    /// Record freshly built images and persist the cache file.
    ///
    /// Entries are upserted even if the file cannot be written; the write
    /// failure is returned for the caller to report.
    pub async fn store(
        &self,
        artifacts: &[Artifact],
        results: &[BuildResult],
        hashes: &HashMap<String, String>,
    ) -> Result<()> {
        if !self.enabled || results.is_empty() {
            return Ok(());
        }

        for built in results {
            let Some(artifact) = artifacts.iter().find(|a| a.image_name == built.image_name) else {
                continue;
            };
            let hash = match hashes.get(&built.image_name) {
                Some(hash) => hash.clone(),
                None => match self.hash_for(artifact).await {
                    Ok(hash) => hash,
                    Err(e) => {
                        warn!(artifact = %built.image_name, error = %e, "not caching build");
                        continue;
                    }
                },
            };
            match self.details_for(&built.tag).await {
                Ok(details) => {
                    lock(&self.entries).insert(hash, details);
                }
                Err(e) => warn!(artifact = %built.image_name, error = %e, "not caching build"),
            }
        }

        let snapshot = lock(&self.entries).clone();
        persistence::save(&self.cache_file, &snapshot)
    }

    /// The local image id is recorded in every mode so a later hit under
    /// another tag can be retagged (and pushed) without a rebuild.
    async fn details_for(&self, tag: &str) -> Result<ImageDetails> {
        let reference = tag.split_once('@').map_or(tag, |(reference, _)| reference);
        let image_id = self.images.image_id(reference).await?;

        let digest = match digest_of(tag) {
            Some(digest) => digest.to_string(),
            None if self.push => self.images.remote_digest(reference).await?.unwrap_or_default(),
            None => String::new(),
        };
        let image_id = match image_id {
            Some(id) => id,
            // Pushed builds may never have been loaded locally.
            None if self.push => String::new(),
            None => return Err(DevError::Build(format!("built image {} not found", reference))),
        };
        Ok(ImageDetails { digest, image_id })
    }
}

#[async_trait]
impl Subscriber for ArtifactCache {
    async fn files_changed(&self, paths: &[PathBuf]) {
        let known: Vec<(String, Artifact)> = lock(&self.valid)
            .iter()
            .map(|(name, (artifact, _))| (name.clone(), artifact.clone()))
            .collect();

        for (name, artifact) in known {
            let stale = match self.builder.dependencies_for_artifact(&artifact).await {
                Ok(deps) => paths.iter().any(|p| deps.contains(p)),
                Err(e) => {
                    debug!(artifact = %name, error = %e, "listing dependencies failed");
                    true
                }
            };
            if stale {
                debug!(artifact = %name, "invalidating cached hash");
                lock(&self.valid).remove(&name);
            }
        }
    }
}

fn result_for(artifact: &Artifact, tag: String) -> BuildResult {
    BuildResult {
        image_name: artifact.image_name.clone(),
        tag,
    }
}

/// A poisoned lock only means another task panicked mid-update; the map
/// itself is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
