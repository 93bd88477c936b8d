use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::ClientError;
use crate::transport::{Launcher, Transport};

/// Owns the server subprocess: at most one live transport at a time.
pub struct ProcessSupervisor {
    launcher: Box<dyn Launcher>,
    handle: Option<Box<dyn Transport>>,
    stop_grace: Duration,
    launches: u64,
}

impl ProcessSupervisor {
    pub fn new(launcher: Box<dyn Launcher>, stop_grace: Duration) -> Self {
        Self {
            launcher,
            handle: None,
            stop_grace,
            launches: 0,
        }
    }

    /// Launch the server unless one is already running.
    ///
    /// Failures are logged and returned; the supervisor stays disconnected
    /// and the next use tries again.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        if self.is_alive() {
            return Ok(());
        }
        if self.handle.is_some() {
            self.stop().await;
        }
        match self.launcher.launch().await {
            Ok(transport) => {
                self.launches += 1;
                self.handle = Some(transport);
                Ok(())
            }
            Err(e) => {
                match &e {
                    ClientError::Launch { stderr, .. } if !stderr.is_empty() => {
                        error!("Vision server failed to start: {e}\n{}", stderr.join("\n"))
                    }
                    _ => error!("Vision server failed to start: {e}"),
                }
                Err(e)
            }
        }
    }

    /// Drain leftover output, then terminate (graceful, then forced).
    pub async fn stop(&mut self) {
        let Some(mut transport) = self.handle.take() else {
            return;
        };
        let drained = transport.drain().await;
        if drained > 0 {
            info!("Discarded {drained} buffered lines before stopping vision server");
        }
        transport.shutdown(self.stop_grace).await;
    }

    pub async fn restart(&mut self) -> Result<(), ClientError> {
        warn!("Restarting vision server");
        self.stop().await;
        self.start().await
    }

    pub fn is_alive(&mut self) -> bool {
        self.handle.as_mut().is_some_and(|t| t.is_alive())
    }

    /// True when a handle exists, alive or not.
    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn transport(&mut self) -> Result<&mut dyn Transport, ClientError> {
        match self.handle.as_mut() {
            Some(t) => Ok(t.as_mut()),
            None => Err(ClientError::NotConnected),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|t| t.pid())
    }

    /// Server lifetimes started so far.
    pub fn launches(&self) -> u64 {
        self.launches
    }
}
