//! # devloop
//!
//! Continuous development for containerized apps on Kubernetes.
//!
//! devloop builds the images of a project, tests and deploys them, then
//! watches the sources. Every change becomes the cheapest action that
//! applies it: a file sync into running containers, a rebuild of only the
//! affected artifacts, a redeploy, or a full reload when the pipeline file
//! itself changed.
//!
//! ## Key Features
//!
//! - **Content-addressed build cache**: unchanged artifacts are never rebuilt
//! - **Debounced watching**: a burst of edits becomes one reconciliation pass
//! - **Stable port forwards**: a replaced pod keeps its local port
//! - **Event stream**: every phase is published for status reporting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devloop::config::{PipelineConfig, RunOptions};
//! use devloop::event::EventBus;
//! use devloop::runner::{Collaborators, Runner};
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> devloop::Result<()> {
//! let config = PipelineConfig::load(Path::new("devloop.yaml"))?;
//! let token = CancellationToken::new();
//! let collaborators = Collaborators::from_config(&config, None, None, &token);
//! let runner = Runner::new(config, RunOptions::default(), collaborators, EventBus::default());
//!
//! // Build, deploy, then keep watching until cancelled.
//! runner.dev(&token).await?;
//! # Ok(())
//! # }
//! ```

pub mod build;
pub mod cache;
pub mod config;
pub mod control;
pub mod deploy;
pub mod docker;
pub mod error;
pub mod event;
pub mod kubernetes;
pub mod logs;
pub mod portforward;
pub mod process;
pub mod retry;
pub mod runner;
pub mod sync;
pub mod test;
pub mod watch;

// Re-exports for convenience
pub use error::{DevError, Result};

pub use build::{BuildResult, Builder, Tagger};
pub use cache::ArtifactCache;
pub use config::{Artifact, PipelineConfig, RunOptions};
pub use deploy::{DeployResult, Deployer};
pub use event::{Event, EventBus, SessionState};
pub use portforward::{PortForwardManager, ResourceKey};
pub use runner::{Collaborators, Runner};
pub use sync::{SyncItem, Syncer};
pub use test::Tester;
pub use watch::{ChangeSet, FileFingerprint, Reconciled, Trigger, Watcher};
