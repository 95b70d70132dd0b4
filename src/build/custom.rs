//! Command-backed builder: runs the artifact's `custom.command` with the
//! target tag in `$IMAGE`.

use async_trait::async_trait;
use ignore::WalkBuilder;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{BuildResult, Builder, ImageTags};
use crate::config::Artifact;
use crate::error::{DevError, Result};
use crate::process;

/// Builds each artifact by running its configured shell command.
#[derive(Debug, Clone, Default)]
pub struct CustomBuilder {
    push: bool,
}

impl CustomBuilder {
    pub fn new(push: bool) -> Self {
        Self { push }
    }
}

#[async_trait]
impl Builder for CustomBuilder {
    async fn build(
        &self,
        token: &CancellationToken,
        tags: &ImageTags,
        artifacts: &[Artifact],
    ) -> Result<Vec<BuildResult>> {
        let mut results = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let tag = tags.get(&artifact.image_name).ok_or_else(|| {
                DevError::Build(format!("no tag generated for {}", artifact.image_name))
            })?;
            if artifact.custom.command.trim().is_empty() {
                return Err(DevError::Build(format!(
                    "artifact {} has no build command",
                    artifact.image_name
                )));
            }

            info!(artifact = %artifact.image_name, tag = %tag, "building");
            let envs = vec![
                ("IMAGE".to_string(), tag.clone()),
                ("PUSH_IMAGE".to_string(), self.push.to_string()),
                ("BUILD_CONTEXT".to_string(), artifact.context.display().to_string()),
            ];
            process::run_shell(&artifact.custom.command, &artifact.context, &envs, token)
                .await
                .map_err(|e| match e {
                    DevError::Cancelled => e,
                    other => DevError::Build(format!("{}: {}", artifact.image_name, other)),
                })?;

            results.push(BuildResult {
                image_name: artifact.image_name.clone(),
                tag: tag.clone(),
            });
        }
        Ok(results)
    }

    async fn dependencies_for_artifact(&self, artifact: &Artifact) -> Result<Vec<PathBuf>> {
        let context = artifact.context.clone();
        let patterns = artifact.custom.dependencies.clone();
        tokio::task::spawn_blocking(move || {
            if patterns.is_empty() {
                Ok(walk_context(&context))
            } else {
                expand_globs(&context, &patterns)
            }
        })
        .await
        .map_err(|e| DevError::List(format!("dependency task failed: {}", e)))?
    }
}

/// Every file under `root`, respecting .gitignore.
pub fn walk_context(root: &Path) -> Vec<PathBuf> {
    let files: BTreeSet<PathBuf> = WalkBuilder::new(root)
        .hidden(true) // skip hidden files
        .git_ignore(true) // respect .gitignore
        .git_global(true)
        .git_exclude(true)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map_or(false, |ft| ft.is_file()))
        .map(|entry| entry.into_path())
        .collect();
    files.into_iter().collect()
}

/// Expand globs relative to `root` into a sorted, de-duplicated file list.
pub fn expand_globs(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = BTreeSet::new();
    for pattern in patterns {
        let full = root.join(pattern);
        let full = full.to_string_lossy();
        let paths = glob::glob(&full)
            .map_err(|e| DevError::List(format!("invalid pattern {}: {}", pattern, e)))?;
        for path in paths {
            let path = path.map_err(|e| DevError::List(e.to_string()))?;
            if path.is_file() {
                files.insert(path);
            } else if path.is_dir() {
                files.extend(walk_context(&path));
            }
        }
    }
    Ok(files.into_iter().collect())
}
