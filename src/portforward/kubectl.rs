//! [`Forwarder`] running `kubectl port-forward`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

use super::{Forwarder, PortForwardEntry};
use crate::error::{DevError, Result};
use crate::retry::{self, RetryPolicy};

/// How long one kubectl process gets to bind its local port.
const READINESS: RetryPolicy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(10));

#[derive(Debug, Clone)]
pub struct KubectlForwarder {
    kube_context: Option<String>,
    kubectl: PathBuf,
    readiness: RetryPolicy,
}

impl KubectlForwarder {
    pub fn new(kube_context: Option<String>) -> Self {
        Self {
            kube_context,
            kubectl: PathBuf::from("kubectl"),
            readiness: READINESS,
        }
    }

    /// Use another kubectl binary.
    pub fn with_kubectl(mut self, kubectl: impl Into<PathBuf>) -> Self {
        self.kubectl = kubectl.into();
        self
    }

    pub fn with_readiness(mut self, readiness: RetryPolicy) -> Self {
        self.readiness = readiness;
        self
    }
}

fn forward_error(entry: &PortForwardEntry, message: impl Into<String>) -> DevError {
    DevError::PortForward {
        resource: entry.key.to_string(),
        message: message.into(),
    }
}

#[async_trait]
impl Forwarder for KubectlForwarder {
    /// Spawns one kubectl and waits until its local port accepts a TCP
    /// connection. Any protocol behind the port counts as up.
    async fn forward(&self, entry: &PortForwardEntry) -> Result<()> {
        let key = &entry.key;
        debug!(resource = %key, local_port = entry.local_port, "starting kubectl port-forward");

        let mut cmd = Command::new(&self.kubectl);
        if let Some(ctx) = &self.kube_context {
            cmd.args(["--context", ctx.as_str()]);
        }
        cmd.arg("port-forward")
            .arg(format!("{}/{}", key.resource_type, key.name))
            .arg(format!("{}:{}", entry.local_port, key.port))
            .args(["--namespace", key.namespace.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| forward_error(entry, e.to_string()))?;

        let port = entry.local_port;
        let ready = retry::poll_immediate(self.readiness, entry.token(), || {
            let exited = child.try_wait();
            async move {
                match exited {
                    Ok(Some(status)) => Err(forward_error(entry, format!("kubectl exited: {}", status))),
                    Err(e) => Err(forward_error(entry, e.to_string())),
                    Ok(None) => Ok(TcpStream::connect(("127.0.0.1", port)).await.is_ok()),
                }
            }
        })
        .await;
        if let Err(e) = ready {
            let _ = child.kill().await;
            return Err(e);
        }

        // The tunnel lives until the entry is terminated.
        let token = entry.token().clone();
        let resource = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = child.kill().await;
                }
                status = child.wait() => {
                    debug!(resource = %resource, status = ?status, "kubectl port-forward exited");
                }
            }
        });
        Ok(())
    }
}
