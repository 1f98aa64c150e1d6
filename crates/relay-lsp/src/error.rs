//! Relay error taxonomy.
//!
//! Every variant is handled inside the relay and converted into log output
//! or a `window/showMessage` notification. None of them end the editor
//! protocol connection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The engine process could not be created.
    #[error("failed to spawn engine `{command}`: {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine process died without being asked to stop.
    #[error("engine exited unexpectedly (code {code:?}, signal {signal:?})")]
    UnexpectedExit {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// The socket connection to the engine could not be opened.
    #[error("failed to connect to engine at {url}: {reason}")]
    ConnectionFailure { url: String, reason: String },

    /// The engine reply was not JSON or did not have a usable shape.
    #[error("malformed engine reply: {0}")]
    MalformedPayload(String),

    /// A write was attempted while the bridge was not open.
    #[error("bridge is not open; dropped {bytes} byte(s)")]
    SendOnClosedConnection { bytes: usize },

    /// The previous analysis request has not been answered yet.
    #[error("engine has not answered the previous request; dropped {bytes} byte(s)")]
    AwaitingReply { bytes: usize },
}
