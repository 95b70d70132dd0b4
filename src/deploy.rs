//! Deploy contract and the command-backed deployer.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::build::custom::expand_globs;
use crate::build::BuildResult;
use crate::config::DeployConfig;
use crate::error::{DevError, Result};
use crate::process;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const RUN_ID_LABEL: &str = "devloop.dev/run-id";

/// Labels applied to everything a session deploys.
pub type Labels = BTreeMap<String, String>;

pub fn default_labels(run_id: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), "devloop".to_string());
    labels.insert(RUN_ID_LABEL.to_string(), run_id.to_string());
    labels
}

/// `k=v,k=v` selector form.
pub fn label_selector(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployResult {
    /// Namespaces the deploy touched.
    pub namespaces: Vec<String>,
}

#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(
        &self,
        token: &CancellationToken,
        builds: &[BuildResult],
        labels: &Labels,
    ) -> Result<DeployResult>;

    /// Files whose change should trigger a redeploy.
    async fn dependencies(&self) -> Result<Vec<PathBuf>>;
}

/// Runs the configured deploy command with one `IMAGE_<NAME>` variable per
/// built image and the session labels in `DEVLOOP_LABELS`.
#[derive(Debug, Clone)]
pub struct CommandDeployer {
    root: PathBuf,
    config: DeployConfig,
}

impl CommandDeployer {
    pub fn new(root: &Path, config: DeployConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
        }
    }
}

/// `gcr.io/proj/web-app` -> `IMAGE_GCR_IO_PROJ_WEB_APP`.
pub fn image_env_name(image_name: &str) -> String {
    let sanitized: String = image_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("IMAGE_{}", sanitized)
}

#[async_trait]
impl Deployer for CommandDeployer {
    async fn deploy(
        &self,
        token: &CancellationToken,
        builds: &[BuildResult],
        labels: &Labels,
    ) -> Result<DeployResult> {
        let mut envs: Vec<(String, String)> = builds
            .iter()
            .map(|b| (image_env_name(&b.image_name), b.tag.clone()))
            .collect();
        envs.push(("DEVLOOP_LABELS".to_string(), label_selector(labels)));
        envs.push(("DEVLOOP_NAMESPACES".to_string(), self.config.namespaces.join(",")));

        info!(images = builds.len(), "deploying");
        process::run_shell(&self.config.command, &self.root, &envs, token)
            .await
            .map_err(|e| match e {
                DevError::Cancelled => e,
                other => DevError::Deploy(other.to_string()),
            })?;

        Ok(DeployResult {
            namespaces: self.config.namespaces.clone(),
        })
    }

    async fn dependencies(&self) -> Result<Vec<PathBuf>> {
        let root = self.root.clone();
        let patterns = self.config.dependencies.clone();
        tokio::task::spawn_blocking(move || expand_globs(&root, &patterns))
            .await
            .map_err(|e| DevError::List(format!("dependency task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn deployer(root: &Path, command: &str, deps: &[&str]) -> CommandDeployer {
        CommandDeployer::new(
            root,
            DeployConfig {
                command: command.to_string(),
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                namespaces: vec!["dev".to_string()],
            },
        )
    }

    #[test]
    fn test_image_env_name() {
        assert_eq!(image_env_name("gcr.io/proj/web-app"), "IMAGE_GCR_IO_PROJ_WEB_APP");
    }

    #[test]
    fn test_labels() {
        let labels = default_labels("abc");
        assert_eq!(
            label_selector(&labels),
            "app.kubernetes.io/managed-by=devloop,devloop.dev/run-id=abc"
        );
    }

    #[tokio::test]
    async fn test_deploy_passes_images_and_labels() {
        let dir = tempdir().unwrap();
        let d = deployer(dir.path(), "echo \"$IMAGE_WEB $DEVLOOP_LABELS\" > out.txt", &[]);
        let builds = vec![BuildResult {
            image_name: "web".to_string(),
            tag: "web:v2".to_string(),
        }];
        let result = d
            .deploy(&CancellationToken::new(), &builds, &default_labels("r1"))
            .await
            .unwrap();
        assert_eq!(result.namespaces, vec!["dev".to_string()]);
        let out = fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert!(out.starts_with("web:v2 "));
        assert!(out.contains("devloop.dev/run-id=r1"));
    }

    #[tokio::test]
    async fn test_failed_deploy() {
        let dir = tempdir().unwrap();
        let err = deployer(dir.path(), "exit 2", &[])
            .deploy(&CancellationToken::new(), &[], &Labels::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DevError::Deploy(_)));
    }

    #[tokio::test]
    async fn test_dependencies_expand_globs() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("k8s")).unwrap();
        fs::write(dir.path().join("k8s/app.yaml"), "").unwrap();
        fs::write(dir.path().join("k8s/notes.txt"), "").unwrap();
        let deps = deployer(dir.path(), "true", &["k8s/*.yaml"]).dependencies().await.unwrap();
        assert_eq!(deps, vec![dir.path().join("k8s/app.yaml")]);
    }
}
