//! Triggers decide when the watcher re-fingerprints its components.
//!
//! * polling: fixed interval ticks, debounced (a quiet tick fires the pass)
//! * notify: filesystem events via `notify-debouncer-mini`, not debounced
//! * manual: ticks pushed by the caller, used by tests and embedders

use notify_debouncer_mini::{new_debouncer, DebouncedEventKind, Debouncer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RunOptions, TriggerKind};
use crate::error::{DevError, Result};

/// Directories whose events never cause a tick.
const IGNORED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    ".devloop",
    "__pycache__",
    ".venv",
];

enum Source {
    Polling { interval: Duration },
    Notify { roots: Vec<PathBuf>, debounce: Duration },
    Manual { ticks: Option<mpsc::Receiver<()>>, debounce: bool },
}

/// Drives the watcher's scan loop.
pub struct Trigger {
    source: Source,
    // Keeps the notify watcher alive for the lifetime of the trigger.
    debouncer: Option<Debouncer<notify::RecommendedWatcher>>,
}

/// Sending half of a manual trigger.
#[derive(Clone)]
pub struct ManualTicks {
    tx: mpsc::Sender<()>,
}

impl ManualTicks {
    /// Deliver one tick. Returns false once the watcher stopped listening.
    pub async fn tick(&self) -> bool {
        self.tx.send(()).await.is_ok()
    }
}

impl Trigger {
    pub fn polling(interval: Duration) -> Self {
        Self {
            source: Source::Polling { interval },
            debouncer: None,
        }
    }

    pub fn notify(roots: Vec<PathBuf>, debounce: Duration) -> Self {
        Self {
            source: Source::Notify { roots, debounce },
            debouncer: None,
        }
    }

    pub fn manual(debounce: bool) -> (Self, ManualTicks) {
        let (tx, rx) = mpsc::channel(1);
        let trigger = Self {
            source: Source::Manual {
                ticks: Some(rx),
                debounce,
            },
            debouncer: None,
        };
        (trigger, ManualTicks { tx })
    }

    /// Build the trigger selected by the run options.
    pub fn from_options(opts: &RunOptions, roots: Vec<PathBuf>) -> Self {
        match opts.trigger {
            TriggerKind::Polling => Self::polling(opts.watch_poll_interval),
            TriggerKind::Notify => Self::notify(roots, opts.notify_debounce),
        }
    }

    /// Whether a burst of changes waits for a quiet tick before firing.
    pub fn debounce(&self) -> bool {
        match &self.source {
            Source::Polling { .. } => true,
            Source::Notify { .. } => false,
            Source::Manual { debounce, .. } => *debounce,
        }
    }

    /// Start producing ticks until `token` is cancelled.
    pub fn start(&mut self, token: CancellationToken) -> Result<mpsc::Receiver<()>> {
        match &mut self.source {
            Source::Polling { interval } => {
                let interval = *interval;
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticker.tick() => {
                                if tx.send(()).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    debug!("polling trigger stopped");
                });
                info!(interval_ms = interval.as_millis() as u64, "watching files by polling");
                Ok(rx)
            }
            Source::Notify { roots, debounce } => {
                let (tx, rx) = mpsc::channel(1);
                let mut debouncer = new_debouncer(
                    *debounce,
                    move |result: std::result::Result<
                        Vec<notify_debouncer_mini::DebouncedEvent>,
                        notify::Error,
                    >| match result {
                        Ok(events) => {
                            let relevant = events.iter().any(|event| {
                                event.kind == DebouncedEventKind::Any && !should_ignore(&event.path)
                            });
                            if relevant {
                                // A full channel already holds a pending tick.
                                let _ = tx.try_send(());
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "file watcher error");
                        }
                    },
                )
                .map_err(notify_error)?;

                for root in roots.iter() {
                    if !root.exists() {
                        warn!(path = %root.display(), "watch root does not exist, skipping");
                        continue;
                    }
                    debouncer
                        .watcher()
                        .watch(root, notify::RecursiveMode::Recursive)
                        .map_err(notify_error)?;
                }

                info!(
                    roots = roots.len(),
                    debounce_ms = debounce.as_millis() as u64,
                    "watching files with filesystem notifications"
                );
                self.debouncer = Some(debouncer);
                Ok(rx)
            }
            Source::Manual { ticks, .. } => ticks
                .take()
                .ok_or_else(|| DevError::Config("manual trigger already started".to_string())),
        }
    }
}

fn notify_error(e: notify::Error) -> DevError {
    DevError::Io(std::io::Error::other(e.to_string()))
}

/// Check if a path lives under an ignored directory.
fn should_ignore(path: &Path) -> bool {
    for component in path.components() {
        if let std::path::Component::Normal(name) = component {
            let name = name.to_string_lossy();
            if IGNORED_DIRS.contains(&name.as_ref()) {
                return true;
            }
        }
    }
    false
}
