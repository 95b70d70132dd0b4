//! Image store: the minimal image operations the artifact cache needs.

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DevError, Result};
use crate::process;

/// Local image daemon / registry capability.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Id of the image currently tagged `tag`, if any.
    async fn image_id(&self, tag: &str) -> Result<Option<String>>;

    /// Whether an image with this id is still present locally.
    async fn image_exists(&self, image_id: &str) -> Result<bool>;

    async fn tag(&self, image_id: &str, tag: &str) -> Result<()>;

    /// Push `tag` and return the registry digest.
    async fn push(&self, tag: &str) -> Result<String>;

    /// Digest the registry holds for `tag`, if any.
    async fn remote_digest(&self, tag: &str) -> Result<Option<String>>;
}

/// [`ImageStore`] backed by the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCli {
    token: CancellationToken,
}

impl DockerCli {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    async fn inspect(&self, reference: &str, format: &str) -> Result<Option<String>> {
        match process::run(
            "docker",
            &["image", "inspect", "--format", format, reference],
            &self.token,
        )
        .await
        {
            Ok(out) => Ok(Some(out.trim().to_string())),
            Err(DevError::Command { message, .. }) if is_not_found(&message) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn is_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no such image") || lower.contains("no such object") || lower.contains("not found")
}

#[derive(Deserialize)]
struct ManifestDescriptor {
    digest: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VerboseManifest {
    descriptor: ManifestDescriptor,
}

/// `docker manifest inspect --verbose` prints one object for a single
/// manifest and an array for a manifest list.
fn parse_manifest_digest(json: &str) -> Result<Option<String>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let first = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        serde_json::Value::Array(_) => return Ok(None),
        other => other,
    };
    let manifest: VerboseManifest = serde_json::from_value(first)?;
    Ok(Some(manifest.descriptor.digest))
}

/// Digest part of `name@sha256:...`, if present.
pub fn digest_of(reference: &str) -> Option<&str> {
    reference.split_once('@').map(|(_, digest)| digest)
}

#[async_trait]
impl ImageStore for DockerCli {
    async fn image_id(&self, tag: &str) -> Result<Option<String>> {
        self.inspect(tag, "{{.Id}}").await
    }

    async fn image_exists(&self, image_id: &str) -> Result<bool> {
        if image_id.is_empty() {
            return Ok(false);
        }
        Ok(self.inspect(image_id, "{{.Id}}").await?.is_some())
    }

    async fn tag(&self, image_id: &str, tag: &str) -> Result<()> {
        debug!(image_id, tag, "tagging image");
        process::run("docker", &["tag", image_id, tag], &self.token).await?;
        Ok(())
    }

    async fn push(&self, tag: &str) -> Result<String> {
        process::run("docker", &["push", tag], &self.token).await?;
        let repo_digest = self
            .inspect(tag, "{{index .RepoDigests 0}}")
            .await?
            .ok_or_else(|| DevError::Build(format!("pushed image {} has no repo digest", tag)))?;
        digest_of(&repo_digest)
            .map(str::to_string)
            .ok_or_else(|| DevError::Build(format!("unexpected repo digest {}", repo_digest)))
    }

    async fn remote_digest(&self, tag: &str) -> Result<Option<String>> {
        match process::run("docker", &["manifest", "inspect", "--verbose", tag], &self.token).await {
            Ok(out) => parse_manifest_digest(&out),
            Err(DevError::Command { message, .. }) if is_not_found(&message) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
