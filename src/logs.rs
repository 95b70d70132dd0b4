//! Log aggregation for deployed pods.
//!
//! Containers of selected pods are tailed concurrently. Output is muted
//! while a reconciliation pass runs so build and deploy progress is not
//! interleaved with application logs.

use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::kubernetes::{Cluster, PodEvent, PodSelector};

/// Where tailed lines go.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

pub fn stdout_sink() -> LogSink {
    Arc::new(|line| println!("{}", line))
}

#[async_trait]
pub trait LogAggregator: Send + Sync {
    async fn start(
        &self,
        token: &CancellationToken,
        selector: Arc<dyn PodSelector>,
        namespaces: &[String],
    ) -> Result<()>;

    fn mute(&self);

    fn unmute(&self);

    async fn stop(&self);
}

/// Drops lines while muted.
#[derive(Clone)]
struct Gate {
    muted: Arc<AtomicBool>,
    sink: LogSink,
}

impl Gate {
    fn emit(&self, line: &str) {
        if !self.muted.load(Ordering::SeqCst) {
            (self.sink)(line);
        }
    }
}

/// Follows `kubectl logs -f` for every container of every selected pod.
pub struct KubectlLogAggregator {
    cluster: Arc<dyn Cluster>,
    kube_context: Option<String>,
    gate: Gate,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl KubectlLogAggregator {
    pub fn new(cluster: Arc<dyn Cluster>, kube_context: Option<String>, sink: LogSink) -> Self {
        Self {
            cluster,
            kube_context,
            gate: Gate {
                muted: Arc::new(AtomicBool::new(false)),
                sink,
            },
            running: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LogAggregator for KubectlLogAggregator {
    async fn start(
        &self,
        token: &CancellationToken,
        selector: Arc<dyn PodSelector>,
        namespaces: &[String],
    ) -> Result<()> {
        self.stop().await;
        let token = token.child_token();
        let mut pods = self.cluster.watch_pods(namespaces, token.clone()).await?;

        let gate = self.gate.clone();
        let kube_context = self.kube_context.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut tailing = HashSet::new();
            loop {
                let event = tokio::select! {
                    _ = task_token.cancelled() => break,
                    event = pods.recv() => event,
                };
                let pod = match event {
                    Some(PodEvent::Added(pod)) | Some(PodEvent::Modified(pod)) => pod,
                    Some(_) => continue,
                    None => break,
                };
                if !pod.is_forwardable() || !selector.select(&pod) {
                    continue;
                }
                for container in &pod.spec.containers {
                    let key = (
                        pod.metadata.namespace.clone(),
                        pod.metadata.name.clone(),
                        container.name.clone(),
                    );
                    if tailing.insert(key.clone()) {
                        let (namespace, pod_name, container_name) = key;
                        tokio::spawn(tail(
                            kube_context.clone(),
                            namespace,
                            pod_name,
                            container_name,
                            gate.clone(),
                            task_token.clone(),
                        ));
                    }
                }
            }
        });

        *self.running.lock().unwrap_or_else(|p| p.into_inner()) = Some((token, handle));
        Ok(())
    }

    fn mute(&self) {
        self.gate.muted.store(true, Ordering::SeqCst);
    }

    fn unmute(&self) {
        self.gate.muted.store(false, Ordering::SeqCst);
    }

    async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((token, handle)) = running {
            token.cancel();
            let _ = handle.await;
        }
    }
}

async fn tail(
    kube_context: Option<String>,
    namespace: String,
    pod: String,
    container: String,
    gate: Gate,
    token: CancellationToken,
) {
    let mut cmd = Command::new("kubectl");
    if let Some(ctx) = &kube_context {
        cmd.args(["--context", ctx.as_str()]);
    }
    cmd.args(["logs", "-f", pod.as_str(), "-c", container.as_str(), "--namespace", namespace.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(pod = %pod, container = %container, error = %e, "cannot tail logs");
            return;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        return;
    };
    let mut lines = BufReader::new(stdout).lines();
    let prefix = format!("[{} {}]", pod, container);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => gate.emit(&format!("{} {}", prefix, line)),
                Ok(None) | Err(_) => break,
            },
        }
    }
    debug!(pod = %pod, container = %container, "log tail ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_drops_lines_while_muted() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let gate = Gate {
            muted: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(move |line| sink_seen.lock().unwrap().push(line.to_string())),
        };
        gate.emit("one");
        gate.muted.store(true, Ordering::SeqCst);
        gate.emit("two");
        gate.muted.store(false, Ordering::SeqCst);
        gate.emit("three");
        assert_eq!(*seen.lock().unwrap(), vec!["one".to_string(), "three".to_string()]);
    }
}
