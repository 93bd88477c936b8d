pub mod process;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClientError;

pub use process::CommandLauncher;

/// A line-oriented duplex channel to one live server instance.
///
/// Implementations must make `recv_line` cancel-safe: if the future is
/// dropped at a deadline, no partially read line may be lost or merged
/// into the next one.
#[async_trait]
pub trait Transport: Send {
    /// Write one line (the newline is appended by the transport) and flush.
    async fn send_line(&mut self, line: &str) -> Result<(), ClientError>;

    /// Next complete line. `Ok(None)` means the stream is closed.
    async fn recv_line(&mut self) -> Result<Option<String>, ClientError>;

    /// Non-blocking liveness probe.
    fn is_alive(&mut self) -> bool;

    /// Discard whatever is already buffered on the output stream.
    /// Returns the number of lines thrown away.
    async fn drain(&mut self) -> usize;

    /// Terminate the server: graceful first, forced after `grace`.
    async fn shutdown(&mut self, grace: Duration);

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Produces fresh transports. One call = one server lifetime.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Transport>, ClientError>;
}
