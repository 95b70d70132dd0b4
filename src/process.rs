//! Subprocess helpers shared by the command-backed collaborators.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DevError, Result};

/// Run `program args..` and return its stdout.
///
/// The child is killed if `token` is cancelled while it runs.
pub async fn run(program: &str, args: &[&str], token: &CancellationToken) -> Result<String> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    let command_line = format!("{} {}", program, args.join(" "));
    output(cmd, command_line, token).await
}

/// Run a shell command line in `cwd` with extra environment variables.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    envs: &[(String, String)],
    token: &CancellationToken,
) -> Result<String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(cwd);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    output(cmd, command.to_string(), token).await
}

async fn output(mut cmd: Command, command_line: String, token: &CancellationToken) -> Result<String> {
    debug!(command = %command_line, "running");
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| DevError::Command {
        command: command_line.clone(),
        message: e.to_string(),
    })?;

    let out = tokio::select! {
        _ = token.cancelled() => return Err(DevError::Cancelled),
        out = child.wait_with_output() => out?,
    };

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        return Err(DevError::Command {
            command: command_line,
            message: format!("{}: {}", out.status, stderr.trim()),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}
