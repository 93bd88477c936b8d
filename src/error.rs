use std::time::Duration;

use thiserror::Error;

/// Why a single attempt against the vision server failed.
///
/// Every variant is recoverable from the client's point of view: the retry
/// loop folds them all into "attempt failed" and hands them to the
/// escalation policy. None of them escape `VisionClient::analyze`.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The subprocess could not be spawned or exited during warm-up.
    #[error("failed to launch vision server: {message}")]
    Launch { message: String, stderr: Vec<String> },

    /// No live subprocess to talk to.
    #[error("vision server not connected")]
    NotConnected,

    /// Pipe write/read failure or closed stream.
    #[error("transport error: {0}")]
    Transport(String),

    /// Unparseable or structurally invalid message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No matching response before the deadline.
    #[error("{method} timed out after {}ms (drained {drained} stale lines)", .after.as_millis())]
    Timeout {
        method: String,
        after: Duration,
        drained: usize,
    },

    /// Well-formed result that is not real analysis output.
    #[error("semantic error: {0}")]
    Semantic(String),

    /// The server answered with an error object or flagged its tool result as failed.
    #[error("server error {code}: {message}")]
    Remote { code: i64, message: String },
}

impl ClientError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "launch",
            Self::NotConnected => "not_connected",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Timeout { .. } => "timeout",
            Self::Semantic(_) => "semantic",
            Self::Remote { .. } => "remote",
        }
    }
}

/// Returned by `analyze` when a newer call started while this one was
/// still retrying. The caller that owned this call is assumed gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("analysis superseded by a newer request")]
pub struct Superseded;
