//! Test contract and the command-backed tester.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::build::custom::expand_globs;
use crate::build::BuildResult;
use crate::config::TestCase;
use crate::error::{DevError, Result};
use crate::process;

#[async_trait]
pub trait Tester: Send + Sync {
    async fn test(&self, token: &CancellationToken, builds: &[BuildResult]) -> Result<()>;

    /// Files whose change should trigger a redeploy.
    async fn dependencies(&self) -> Result<Vec<PathBuf>>;
}

/// Runs each test case's commands with `$IMAGE` set to the built tag.
#[derive(Debug, Clone)]
pub struct CommandTester {
    root: PathBuf,
    cases: Vec<TestCase>,
}

impl CommandTester {
    pub fn new(root: &Path, cases: Vec<TestCase>) -> Self {
        Self {
            root: root.to_path_buf(),
            cases,
        }
    }
}

#[async_trait]
impl Tester for CommandTester {
    async fn test(&self, token: &CancellationToken, builds: &[BuildResult]) -> Result<()> {
        for case in &self.cases {
            let Some(built) = builds.iter().find(|b| b.image_name == case.image) else {
                debug!(image = %case.image, "image not built, skipping its tests");
                continue;
            };
            let envs = vec![("IMAGE".to_string(), built.tag.clone())];
            for command in &case.commands {
                info!(image = %case.image, command = %command, "running test");
                process::run_shell(command, &self.root, &envs, token)
                    .await
                    .map_err(|e| match e {
                        DevError::Cancelled => e,
                        other => DevError::Test(format!("{}: {}", case.image, other)),
                    })?;
            }
        }
        Ok(())
    }

    async fn dependencies(&self) -> Result<Vec<PathBuf>> {
        let root = self.root.clone();
        let patterns: Vec<String> = self
            .cases
            .iter()
            .flat_map(|c| c.dependencies.iter().cloned())
            .collect();
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

    fn case(image: &str, commands: &[&str], deps: &[&str]) -> TestCase {
        TestCase {
            image: image.to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn built(name: &str) -> Vec<BuildResult> {
        vec![BuildResult {
            image_name: name.to_string(),
            tag: format!("{}:t", name),
        }]
    }

    #[tokio::test]
    async fn test_runs_commands_for_built_images() {
        let dir = tempdir().unwrap();
        let tester = CommandTester::new(
            dir.path(),
            vec![
                case("web", &["echo $IMAGE >> ran.txt"], &[]),
                case("worker", &["exit 1"], &[]),
            ],
        );
        tester.test(&CancellationToken::new(), &built("web")).await.unwrap();
        let ran = fs::read_to_string(dir.path().join("ran.txt")).unwrap();
        assert_eq!(ran.trim(), "web:t");
    }

    #[tokio::test]
    async fn test_failure_is_test_error() {
        let dir = tempdir().unwrap();
        let tester = CommandTester::new(dir.path(), vec![case("web", &["exit 1"], &[])]);
        let err = tester.test(&CancellationToken::new(), &built("web")).await.unwrap_err();
        assert!(matches!(err, DevError::Test(_)));
    }

    #[tokio::test]
    async fn test_dependencies_union() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a_test.go"), "").unwrap();
        fs::write(dir.path().join("api.yaml"), "").unwrap();
        let tester = CommandTester::new(
            dir.path(),
            vec![case("web", &[], &["*_test.go"]), case("api", &[], &["api.yaml"])],
        );
        let deps = tester.dependencies().await.unwrap();
        assert_eq!(deps, vec![dir.path().join("a_test.go"), dir.path().join("api.yaml")]);
    }
}
