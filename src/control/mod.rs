//! Control socket for a running dev session.
//!
//! `devloop dev` listens on a Unix socket in the project's state directory
//! so that other invocations can query or stop it:
//!
//! ```text
//! devloop dev  <── .devloop/devloop.sock ──>  devloop status / devloop stop
//! ```
//!
//! Requests and responses are single lines of JSON.

pub mod protocol;
pub mod server;

pub use protocol::{Request, Response};
pub use server::{is_running, pid_path, send_request, serve, socket_path};
