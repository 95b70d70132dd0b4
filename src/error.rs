//! Error taxonomy for the dev loop.
//!
//! Errors fall into four groups: fatal-to-session (registration, initial
//! build/deploy), recoverable-per-pass (build, sync, port-forward, cache
//! probes), the configuration-changed control signal, and cancellation.

use std::path::PathBuf;

/// Errors produced by the dev loop engine.
#[derive(Debug, thiserror::Error)]
pub enum DevError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A dependency lister failed (e.g. a glob could not be expanded).
    #[error("listing files: {0}")]
    List(String),

    /// A listed path vanished between listing and stat.
    #[error("stat {}: {source}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The initial fingerprint of a watched component could not be captured.
    #[error("registering watched component {name}: {source}")]
    Registration {
        name: String,
        #[source]
        source: Box<DevError>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("test failed: {0}")]
    Test(String),

    #[error("deploy failed: {0}")]
    Deploy(String),

    #[error("sync failed: {0}")]
    Sync(String),

    #[error("generating tag for {image}: {message}")]
    Tag { image: String, message: String },

    #[error("port forwarding {resource}: {message}")]
    PortForward { resource: String, message: String },

    /// A subprocess exited unsuccessfully.
    #[error("running {command}: {message}")]
    Command { command: String, message: String },

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("timed out after {0:?}")]
    RetryTimeout(std::time::Duration),

    /// The pipeline configuration file changed; the caller must reload.
    #[error("configuration changed")]
    ConfigurationChanged,

    #[error("cancelled")]
    Cancelled,
}

impl DevError {
    /// True for the reload control signal.
    pub fn is_configuration_changed(&self) -> bool {
        matches!(self, DevError::ConfigurationChanged)
    }

    /// True when the operation was interrupted by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DevError::Cancelled)
    }
}

impl From<serde_yaml::Error> for DevError {
    fn from(e: serde_yaml::Error) -> Self {
        DevError::Parse(format!("yaml: {}", e))
    }
}

impl From<serde_json::Error> for DevError {
    fn from(e: serde_json::Error) -> Self {
        DevError::Parse(format!("json: {}", e))
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DevError>;
