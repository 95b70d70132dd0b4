//! [`Cluster`] over the `kubectl` CLI.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Cluster, List, Pod, PodEvent, Service};
use crate::error::{DevError, Result};
use crate::process;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct KubectlCluster {
    kube_context: Option<String>,
}

impl KubectlCluster {
    pub fn new(kube_context: Option<String>) -> Self {
        Self { kube_context }
    }

    fn context_args(&self) -> Vec<String> {
        match &self.kube_context {
            Some(ctx) => vec!["--context".to_string(), ctx.clone()],
            None => Vec::new(),
        }
    }
}

/// Parse every complete JSON event at the front of `buf` and drop the
/// consumed bytes. A trailing partial document stays for the next read; an
/// unparsable one is skipped up to the next line that opens a document.
pub fn drain_events(buf: &mut Vec<u8>) -> Vec<PodEvent> {
    let mut events = Vec::new();
    let mut consumed = 0;
    loop {
        let mut stream = serde_json::Deserializer::from_slice(&buf[consumed..]).into_iter::<PodEvent>();
        let (offset, skipped) = loop {
            let start = stream.byte_offset();
            match stream.next() {
                Some(Ok(event)) => events.push(event),
                Some(Err(e)) if e.is_eof() => break (start, false),
                Some(Err(e)) => {
                    warn!(error = %e, "discarding unparsable watch output");
                    break (next_document(&buf[consumed..], start), true);
                }
                None => break (stream.byte_offset(), false),
            }
        };
        consumed += offset;
        if !skipped || consumed == buf.len() {
            break;
        }
    }
    buf.drain(..consumed);
    events
}

/// Offset of the next line that starts with `{` past the document at
/// `from`, or the end of `buf` when no further document has begun.
fn next_document(buf: &[u8], from: usize) -> usize {
    let begin = buf[from..]
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(buf.len(), |i| from + i);
    buf[begin..]
        .windows(2)
        .position(|w| w == b"\n{")
        .map_or(buf.len(), |i| begin + i + 1)
}

#[async_trait]
impl Cluster for KubectlCluster {
    async fn watch_pods(
        &self,
        namespaces: &[String],
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<PodEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        for namespace in namespaces {
            let mut cmd = Command::new("kubectl");
            cmd.args(self.context_args())
                .args(["get", "pods", "--watch", "--output-watch-events", "-o", "json"])
                .args(["--namespace", namespace.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            let mut child = cmd.spawn().map_err(|e| DevError::Cluster(format!("kubectl: {}", e)))?;
            let mut stdout = child
                .stdout
                .take()
                .ok_or_else(|| DevError::Cluster("kubectl stdout unavailable".to_string()))?;

            let tx = tx.clone();
            let token = token.clone();
            let namespace = namespace.clone();
            tokio::spawn(async move {
                let _child = child;
                let mut buf = Vec::new();
                let mut chunk = [0u8; 8192];
                loop {
                    let n = tokio::select! {
                        _ = token.cancelled() => break,
                        n = stdout.read(&mut chunk) => match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        },
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    for event in drain_events(&mut buf) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                debug!(namespace = %namespace, "pod watch ended");
            });
        }
        Ok(rx)
    }

    async fn list_services(&self, namespaces: &[String], label: &str) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        for namespace in namespaces {
            services.extend(self.get::<Service>("services", Some(label), namespace).await?);
        }
        Ok(services)
    }

    async fn list_pods(&self, namespaces: &[String]) -> Result<Vec<Pod>> {
        let mut pods = Vec::new();
        for namespace in namespaces {
            pods.extend(self.get::<Pod>("pods", None, namespace).await?);
        }
        Ok(pods)
    }
}

impl KubectlCluster {
    async fn get<T: DeserializeOwned>(&self, kind: &str, label: Option<&str>, namespace: &str) -> Result<Vec<T>> {
        let mut args = self.context_args();
        args.extend(["get", kind, "-o", "json", "--namespace", namespace].map(String::from));
        if let Some(label) = label {
            args.extend(["-l".to_string(), label.to_string()]);
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = process::run("kubectl", &args, &CancellationToken::new())
            .await
            .map_err(|e| DevError::Cluster(e.to_string()))?;
        let list: List<T> = serde_json::from_str(&out)?;
        Ok(list.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDED: &str = r#"{"type":"ADDED","object":{"metadata":{"name":"a","resourceVersion":"1"}}}"#;
    const DELETED: &str = r#"{"type":"DELETED","object":{"metadata":{"name":"a","resourceVersion":"2"}}}"#;

    #[test]
    fn test_drain_complete_events() {
        let mut buf = format!("{}\n{}\n", ADDED, DELETED).into_bytes();
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PodEvent::Added(_)));
        assert!(matches!(events[1], PodEvent::Deleted(_)));
        assert!(buf.iter().all(|b| b.is_ascii_whitespace()));
    }

    #[test]
    fn test_partial_event_is_kept() {
        let (head, tail) = DELETED.split_at(20);
        let mut buf = format!("{}\n{}", ADDED, head).into_bytes();
        assert_eq!(drain_events(&mut buf).len(), 1);
        assert!(drain_events(&mut buf).is_empty());

        buf.extend_from_slice(tail.as_bytes());
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        match &events[0] {
            PodEvent::Deleted(pod) => assert_eq!(pod.metadata.generation(), 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_bad_document_skips_only_itself() {
        let (head, tail) = DELETED.split_at(20);
        let bad = "{\n  \"type\": nonsense\n}";
        let mut buf = format!("{}\n{}\n{}", bad, ADDED, head).into_bytes();

        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PodEvent::Added(_)));
        assert_eq!(String::from_utf8_lossy(&buf).trim_start(), head);

        buf.extend_from_slice(tail.as_bytes());
        let events = drain_events(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PodEvent::Deleted(_)));
    }

    #[test]
    fn test_service_list_parses() {
        let json = r#"{"items":[{"metadata":{"name":"web","namespace":"default","resourceVersion":"7"},"spec":{"ports":[{"name":"http","port":80,"targetPort":8080}]}}]}"#;
        let list: List<Service> = serde_json::from_str(json).unwrap();
        assert_eq!(list.items[0].spec.ports[0].port, 80);
    }
}
