//! Build contracts: the [`Builder`] and [`Tagger`] collaborators and the
//! results they produce.

pub mod custom;
pub mod tag;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::config::Artifact;
use crate::error::Result;

pub use custom::CustomBuilder;
pub use tag::{tagger_for, ChecksumTagger, CustomTag, DateTimeTagger, Tagger};

/// Image name -> fully qualified tag for one pass.
pub type ImageTags = BTreeMap<String, String>;

/// One built image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResult {
    pub image_name: String,
    pub tag: String,
}

/// Builds artifacts. All-or-nothing: one failing artifact fails the call.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(
        &self,
        token: &CancellationToken,
        tags: &ImageTags,
        artifacts: &[Artifact],
    ) -> Result<Vec<BuildResult>>;

    /// Files whose change should rebuild `artifact`.
    async fn dependencies_for_artifact(&self, artifact: &Artifact) -> Result<Vec<PathBuf>>;
}

/// Replace previous results by image name, keeping images not rebuilt.
pub fn merge_with_previous_builds(
    builds: &[BuildResult],
    previous: &[BuildResult],
) -> Vec<BuildResult> {
    let mut merged: Vec<BuildResult> = previous
        .iter()
        .filter(|old| !builds.iter().any(|b| b.image_name == old.image_name))
        .cloned()
        .collect();
    merged.extend(builds.iter().cloned());
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, tag: &str) -> BuildResult {
        BuildResult {
            image_name: name.to_string(),
            tag: tag.to_string(),
        }
    }

    #[test]
    fn test_merge_replaces_by_image_name() {
        let previous = vec![result("web", "web:1"), result("worker", "worker:1")];
        let merged = merge_with_previous_builds(&[result("web", "web:2")], &previous);
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&result("web", "web:2")));
        assert!(merged.contains(&result("worker", "worker:1")));
        assert!(!merged.contains(&result("web", "web:1")));
    }

    #[test]
    fn test_merge_with_nothing_previous() {
        let merged = merge_with_previous_builds(&[result("a", "a:1")], &[]);
        assert_eq!(merged, vec![result("a", "a:1")]);
    }
}
