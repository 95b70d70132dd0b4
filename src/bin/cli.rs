//! devloop CLI - continuous build, deploy and port-forward for Kubernetes.
//!
//! Usage:
//!   devloop dev                  # Build, deploy, then watch and redeploy
//!   devloop run                  # Build, test and deploy once
//!   devloop build                # Build and test, no deploy
//!   devloop status               # State of the running dev session
//!   devloop stop                 # Stop the running dev session

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use devloop::config::{PipelineConfig, RunOptions, Settings, TriggerKind};
use devloop::control::{self, Request, Response};
use devloop::event::EventBus;
use devloop::runner::{Collaborators, Runner};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "devloop")]
#[command(about = "devloop - continuous development for Kubernetes apps", long_about = None)]
struct Cli {
    /// Pipeline file
    #[arg(short, long, global = true, default_value = devloop::config::DEFAULT_CONFIG_FILE)]
    filename: PathBuf,

    /// Global settings file (default: ~/.devloop/config.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and deploy, then rebuild, resync or redeploy on every change
    Dev {
        #[command(flatten)]
        session: SessionArgs,

        /// Forward ports of deployed pods and services
        #[arg(long)]
        port_forward: bool,

        /// Stream logs of deployed pods
        #[arg(long)]
        tail: bool,

        /// Only watch artifacts whose image name contains one of these
        #[arg(short, long = "watch-image")]
        watch_image: Vec<String>,

        /// File change trigger: polling or notify
        #[arg(long)]
        trigger: Option<TriggerKind>,
    },

    /// Build, test and deploy once
    Run {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Build and test every artifact without deploying
    Build {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Show the state of the running dev session
    Status,

    /// Stop the running dev session
    Stop,
}

#[derive(Args)]
struct SessionArgs {
    /// Do not use or update the artifact cache
    #[arg(long)]
    no_cache: bool,

    /// Skip the test phase
    #[arg(long)]
    skip_tests: bool,

    /// Tag for the `custom` tag policy
    #[arg(short, long)]
    tag: Option<String>,

    /// kubectl context to use
    #[arg(long)]
    kube_context: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devloop=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings_path = cli.settings.clone().or_else(Settings::default_path);
    let settings = match &settings_path {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    let base = RunOptions {
        config_file: cli.filename.clone(),
        ..RunOptions::default()
    }
    .with_settings(&settings);

    match cli.command {
        Commands::Dev {
            session,
            port_forward,
            tail,
            watch_image,
            trigger,
        } => {
            let mut opts = session.apply(base);
            opts.port_forward = port_forward;
            opts.tail = tail;
            opts.target_images = watch_image;
            if let Some(trigger) = trigger {
                opts.trigger = trigger;
            }
            dev(opts, &session).await
        }

        Commands::Run { session } => {
            let opts = session.apply(base);
            let token = cancel_on_ctrl_c();
            let runner = new_runner(&opts, &session, &token, EventBus::default())?;
            let result = runner.run(&token).await?;
            for build in runner.builds() {
                println!("{} -> {}", build.image_name, build.tag);
            }
            println!("deployed to {}", result.namespaces.join(", "));
            Ok(())
        }

        Commands::Build { session } => {
            let opts = session.apply(base);
            let token = cancel_on_ctrl_c();
            let runner = new_runner(&opts, &session, &token, EventBus::default())?;
            let artifacts = runner.config().build.artifacts.clone();
            for build in runner.build_and_test(&token, &artifacts).await? {
                println!("{} -> {}", build.image_name, build.tag);
            }
            Ok(())
        }

        Commands::Status => {
            let root = project_root(&cli.filename);
            if !control::is_running(&root) {
                bail!("no dev session running in {}", root.display());
            }
            match control::send_request(&root, &Request::State)? {
                Response::Ok { data } => println!("{}", serde_json::to_string_pretty(&data)?),
                Response::Error { message } => bail!(message),
                other => bail!("unexpected response: {:?}", other),
            }
            Ok(())
        }

        Commands::Stop => {
            let root = project_root(&cli.filename);
            if !control::is_running(&root) {
                println!("no dev session running");
                return Ok(());
            }
            match control::send_request(&root, &Request::Shutdown)? {
                Response::Goodbye => println!("dev session stopping"),
                other => bail!("unexpected response: {:?}", other),
            }
            Ok(())
        }
    }
}

impl SessionArgs {
    fn apply(&self, mut opts: RunOptions) -> RunOptions {
        opts.cache_artifacts = !self.no_cache;
        opts.skip_tests = self.skip_tests;
        opts
    }
}

/// Dev mode restarts from a freshly loaded pipeline whenever the file changes.
async fn dev(opts: RunOptions, session: &SessionArgs) -> Result<()> {
    let token = cancel_on_ctrl_c();
    let events = EventBus::default();
    let root = project_root(&opts.config_file);

    if control::is_running(&root) {
        bail!("a dev session is already running in {}", root.display());
    }
    let control = tokio::spawn({
        let root = root.clone();
        let events = events.clone();
        let token = token.clone();
        async move {
            if let Err(e) = control::serve(&root, events, token).await {
                warn!(error = %e, "control socket unavailable");
            }
        }
    });

    let outcome = loop {
        let runner = match new_runner(&opts, session, &token, events.clone()) {
            Ok(runner) => runner,
            Err(e) => break Err(e),
        };
        match runner.dev(&token).await {
            Err(e) if e.is_configuration_changed() => {
                info!("pipeline config changed, restarting dev loop");
                continue;
            }
            Err(e) if e.is_cancelled() => break Ok(()),
            Err(e) => break Err(e.into()),
            Ok(()) => break Ok(()),
        }
    };

    token.cancel();
    let _ = control.await;
    outcome
}

fn new_runner(
    opts: &RunOptions,
    session: &SessionArgs,
    token: &CancellationToken,
    events: EventBus,
) -> Result<Runner> {
    let config = PipelineConfig::load(&opts.config_file)
        .with_context(|| format!("loading {}", opts.config_file.display()))?;
    let collaborators = Collaborators::from_config(
        &config,
        session.tag.as_deref(),
        session.kube_context.clone(),
        token,
    );
    Ok(Runner::new(config, opts.clone(), collaborators, events))
}

fn project_root(config_file: &Path) -> PathBuf {
    let root = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    root.canonicalize().unwrap_or(root)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            on_signal.cancel();
        }
    });
    token
}
