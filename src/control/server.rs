//! Control server: answers requests while a dev session runs.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader as AsyncBufReader};
use tokio::net::{UnixListener, UnixStream as AsyncUnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::STATE_DIR;
use crate::error::{DevError, Result};
use crate::event::EventBus;

use super::protocol::{Request, Response};

/// Socket path in the project's state directory.
pub fn socket_path(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join("devloop.sock")
}

/// PID file path
pub fn pid_path(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join("devloop.pid")
}

/// Serve control requests until `token` is cancelled. A shutdown request
/// cancels `token`, which also ends the session it belongs to.
pub async fn serve(root: &Path, events: EventBus, token: CancellationToken) -> Result<()> {
    let sock_path = socket_path(root);
    let pid_file = pid_path(root);

    if let Some(dir) = sock_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    // Remove stale socket if exists
    if sock_path.exists() {
        std::fs::remove_file(&sock_path)?;
    }
    std::fs::write(&pid_file, std::process::id().to_string())?;

    let listener = UnixListener::bind(&sock_path)?;
    info!(socket = %sock_path.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let events = events.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, &events, &token).await {
                            debug!(error = %e, "client handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            },
        }
    }

    debug!("control socket closing");
    let _ = std::fs::remove_file(&sock_path);
    let _ = std::fs::remove_file(&pid_file);
    Ok(())
}

async fn handle_client(stream: AsyncUnixStream, events: &EventBus, token: &CancellationToken) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = AsyncBufReader::new(reader);

    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => {
            debug!(?request, "received request");
            process_request(request, events, token)
        }
        Err(e) => Response::error(format!("bad request: {}", e)),
    };

    let mut response_json = serde_json::to_string(&response)?;
    response_json.push('\n');
    writer.write_all(response_json.as_bytes()).await?;
    Ok(())
}

fn process_request(request: Request, events: &EventBus, token: &CancellationToken) -> Response {
    match request {
        Request::Ping => Response::Pong,
        Request::State => Response::ok(events.state()),
        Request::Shutdown => {
            info!("shutdown requested over control socket");
            token.cancel();
            Response::Goodbye
        }
    }
}

/// Check if a session is running by checking the PID file and process.
pub fn is_running(root: &Path) -> bool {
    let Ok(pid_str) = std::fs::read_to_string(pid_path(root)) else {
        return false;
    };
    match pid_str.trim().parse::<i32>() {
        // Signal 0 only checks that the process exists.
        Ok(pid) => unsafe { libc::kill(pid, 0) == 0 },
        Err(_) => false,
    }
}

/// Send a request to the running session and wait for its response.
pub fn send_request(root: &Path, request: &Request) -> Result<Response> {
    let mut stream = UnixStream::connect(socket_path(root))?;

    let request_json = serde_json::to_string(request)?;
    writeln!(stream, "{}", request_json)?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;
    if response_line.is_empty() {
        return Err(DevError::Parse("control socket closed without a response".to_string()));
    }

    Ok(serde_json::from_str(&response_line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn wait_for_socket(root: &Path) {
        for _ in 0..200 {
            if socket_path(root).exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("control socket never appeared");
    }

    async fn request(root: &Path, request: Request) -> Response {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || send_request(&root, &request))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_state_and_shutdown() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let events = EventBus::default();
        events.publish(Event::DevLoopStarted { iteration: 4 });
        let token = CancellationToken::new();

        let server = tokio::spawn({
            let root = root.clone();
            let events = events.clone();
            let token = token.clone();
            async move { serve(&root, events, token).await }
        });
        wait_for_socket(&root).await;
        assert!(is_running(&root));

        assert_eq!(request(&root, Request::Ping).await, Response::Pong);
        match request(&root, Request::State).await {
            Response::Ok { data } => assert_eq!(data["iteration"], 4),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(request(&root, Request::Shutdown).await, Response::Goodbye);

        server.await.unwrap().unwrap();
        assert!(token.is_cancelled());
        assert!(!socket_path(&root).exists());
        assert!(!is_running(&root));
    }

    #[test]
    fn test_not_running_without_pid_file() {
        let dir = tempdir().unwrap();
        assert!(!is_running(dir.path()));
    }
}
