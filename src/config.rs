//! Configuration: the pipeline file, global settings and per-run options.
//!
//! The pipeline file (`devloop.yaml`) describes artifacts, tests, the deploy
//! step and user-declared port forwards. It is itself watched during dev
//! mode; editing it ends the session with [`DevError::ConfigurationChanged`].
//!
//! Global settings live in `~/.devloop/config.toml` and only tune the engine
//! (cache location, trigger kind, poll interval).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{DevError, Result};

/// Default pipeline file name, looked up in the project root.
pub const DEFAULT_CONFIG_FILE: &str = "devloop.yaml";

/// Directory (under `$HOME` or the project root) holding engine state.
pub const STATE_DIR: &str = ".devloop";

const DEFAULT_CACHE_FILE: &str = "cache";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_NOTIFY_DEBOUNCE_MS: u64 = 200;

/// The pipeline: what to build, test, deploy and forward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default)]
    pub api_version: String,
    pub build: BuildConfig,
    #[serde(default)]
    pub test: Vec<TestCase>,
    pub deploy: DeployConfig,
    #[serde(default)]
    pub port_forward: Vec<PortForwardResource>,
    /// Directory containing the pipeline file; relative paths resolve here.
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub tag_policy: TagPolicy,
    /// Push built images to a registry instead of keeping them local.
    #[serde(default)]
    pub push: bool,
}

/// A named buildable image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(rename = "image")]
    pub image_name: String,
    /// Build context (workspace), relative to the pipeline file.
    #[serde(default = "default_context")]
    pub context: PathBuf,
    #[serde(default)]
    pub custom: CustomBuild,
    /// Sync rules: source glob (relative to the context) -> container destination.
    #[serde(default)]
    pub sync: BTreeMap<String, String>,
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

/// Build-configuration payload of an artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct CustomBuild {
    /// Shell command producing the image; `$IMAGE` holds the target tag.
    #[serde(default)]
    pub command: String,
    /// Dependency globs relative to the context. Empty = whole context.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// At most one tag policy should be set; checksum-style tagging is the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagPolicy {
    #[serde(default)]
    pub sha: Option<ShaTagger>,
    #[serde(default)]
    pub date_time: Option<DateTimeTagger>,
    #[serde(default)]
    pub custom: Option<CustomTagger>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ShaTagger {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeTagger {
    /// chrono strftime format; defaults to `%Y-%m-%d_%H-%M-%S`.
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CustomTagger {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    pub command: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,
}

fn default_namespaces() -> Vec<String> {
    vec!["default".to_string()]
}

/// A cluster resource the user wants forwarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardResource {
    pub resource_type: String,
    pub resource_name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub port: u16,
    #[serde(default)]
    pub local_port: Option<u16>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl PipelineConfig {
    /// Load and validate a pipeline file, resolving artifact contexts
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: PipelineConfig = serde_yaml::from_str(&contents)?;

        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let root = root.canonicalize().unwrap_or(root);

        for artifact in &mut config.build.artifacts {
            if artifact.context.is_relative() {
                artifact.context = root.join(&artifact.context);
            }
        }
        config.root = root;
        config.validate()?;

        debug!(
            path = %path.display(),
            artifacts = config.build.artifacts.len(),
            "pipeline config loaded"
        );
        Ok(config)
    }

    /// Reject configurations the engine cannot act on.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for artifact in &self.build.artifacts {
            if artifact.image_name.is_empty() {
                return Err(DevError::Config("artifact with empty image name".to_string()));
            }
            if !seen.insert(artifact.image_name.as_str()) {
                return Err(DevError::Config(format!(
                    "duplicate artifact image name {}",
                    artifact.image_name
                )));
            }
        }
        if self.deploy.command.trim().is_empty() {
            return Err(DevError::Config("deploy.command must not be empty".to_string()));
        }
        let policies = [
            self.build.tag_policy.sha.is_some(),
            self.build.tag_policy.date_time.is_some(),
            self.build.tag_policy.custom.is_some(),
        ];
        if policies.iter().filter(|set| **set).count() > 1 {
            return Err(DevError::Config("only one tag policy may be set".to_string()));
        }
        Ok(())
    }
}

/// Which trigger drives the watcher.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    #[default]
    Polling,
    Notify,
}

impl std::str::FromStr for TriggerKind {
    type Err = DevError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "polling" => Ok(TriggerKind::Polling),
            "notify" => Ok(TriggerKind::Notify),
            other => Err(DevError::Config(format!("unknown trigger {}", other))),
        }
    }
}

/// Global engine settings (`~/.devloop/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub cache_file: Option<PathBuf>,
    pub local_cluster: Option<bool>,
    pub trigger: TriggerKind,
    pub watch_poll_interval_ms: Option<u64>,
}

impl Settings {
    /// Default settings path, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(STATE_DIR).join("config.toml"))
    }

    /// Load settings; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| DevError::Parse(format!("toml: {}", e)))
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Options for one dev/run session.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_file: PathBuf,
    pub cache_artifacts: bool,
    pub cache_file: PathBuf,
    pub skip_tests: bool,
    pub port_forward: bool,
    pub tail: bool,
    /// Only artifacts whose image name contains one of these are watched.
    pub target_images: Vec<String>,
    pub trigger: TriggerKind,
    pub watch_poll_interval: Duration,
    pub notify_debounce: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_CONFIG_FILE),
            cache_artifacts: true,
            cache_file: default_cache_file(),
            skip_tests: false,
            port_forward: false,
            tail: false,
            target_images: Vec::new(),
            trigger: TriggerKind::Polling,
            watch_poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            notify_debounce: Duration::from_millis(DEFAULT_NOTIFY_DEBOUNCE_MS),
        }
    }
}

impl RunOptions {
    /// Apply global settings underneath explicit options.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        if let Some(cache_file) = &settings.cache_file {
            self.cache_file = cache_file.clone();
        }
        self.trigger = settings.trigger;
        if let Some(ms) = settings.watch_poll_interval_ms {
            self.watch_poll_interval = Duration::from_millis(ms);
        }
        self
    }

    pub fn is_target_image(&self, artifact: &Artifact) -> bool {
        self.target_images.is_empty()
            || self
                .target_images
                .iter()
                .any(|target| artifact.image_name.contains(target.as_str()))
    }
}

fn default_cache_file() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR)
        .join(DEFAULT_CACHE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PIPELINE: &str = r#"
apiVersion: devloop/v1
build:
  artifacts:
    - image: web
      context: web
      custom:
        command: docker build -t $IMAGE .
      sync:
        "static/*.css": /app/static
    - image: worker
  tagPolicy:
    dateTime:
      format: "%Y%m%d"
deploy:
  command: kubectl apply -f k8s/
  dependencies: ["k8s/*.yaml"]
portForward:
  - resourceType: service
    resourceName: web
    port: 8080
"#;

    #[test]
    fn test_load_resolves_contexts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, PIPELINE).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.root, root);
        assert_eq!(config.build.artifacts[0].context, root.join("web"));
        assert_eq!(config.build.artifacts[1].context, root.join("."));
        assert_eq!(config.build.artifacts[0].sync["static/*.css"], "/app/static");
        assert_eq!(config.deploy.namespaces, vec!["default".to_string()]);
        assert_eq!(config.port_forward[0].namespace, "default");
        assert_eq!(
            config.build.tag_policy.date_time.as_ref().unwrap().format.as_deref(),
            Some("%Y%m%d")
        );
    }

    #[test]
    fn test_duplicate_images_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(
            &path,
            "build:\n  artifacts:\n    - image: a\n    - image: a\ndeploy:\n  command: \"true\"\n",
        )
        .unwrap();
        let err = PipelineConfig::load(&path).unwrap_err();
        assert!(matches!(err, DevError::Config(_)));
    }

    #[test]
    fn test_missing_settings_file_is_default() {
        let settings = Settings::load(Path::new("/nonexistent/devloop/config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_settings_override_options() {
        let settings: Settings = toml::from_str(
            "trigger = \"notify\"\nwatch_poll_interval_ms = 250\ncache_file = \"/tmp/c\"\n",
        )
        .unwrap();
        let opts = RunOptions::default().with_settings(&settings);
        assert_eq!(opts.trigger, TriggerKind::Notify);
        assert_eq!(opts.watch_poll_interval, Duration::from_millis(250));
        assert_eq!(opts.cache_file, PathBuf::from("/tmp/c"));
    }

    #[test]
    fn test_target_image_filter() {
        let artifact = Artifact {
            image_name: "gcr.io/proj/web".to_string(),
            context: PathBuf::from("."),
            custom: CustomBuild::default(),
            sync: BTreeMap::new(),
        };
        let mut opts = RunOptions::default();
        assert!(opts.is_target_image(&artifact));
        opts.target_images = vec!["web".to_string()];
        assert!(opts.is_target_image(&artifact));
        opts.target_images = vec!["worker".to_string()];
        assert!(!opts.is_target_image(&artifact));
    }
}
