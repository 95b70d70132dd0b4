//! Request/response types spoken over the control socket.

use serde::{Deserialize, Serialize};

/// Request from a CLI invocation to the running session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Request {
    /// Check the session is alive
    #[serde(rename = "ping")]
    Ping,

    /// Snapshot of builds, deploys, syncs and forwards so far
    #[serde(rename = "state")]
    State,

    /// End the session
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response from the running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok { data: serde_json::Value },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "goodbye")]
    Goodbye,
}

impl Response {
    pub fn ok<T: Serialize>(data: T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Response::Ok { data },
            Err(e) => Response::error(format!("serializing response: {}", e)),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { message: msg.into() }
    }
}
