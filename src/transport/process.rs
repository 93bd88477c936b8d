use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ClientError;
use crate::protocol::truncate;

use super::{Launcher, Transport};

/// Lines of stderr kept around for diagnosing an early exit.
const STDERR_TAIL_LINES: usize = 64;
/// How long `drain` waits for each further buffered line.
const DRAIN_POLL: Duration = Duration::from_millis(20);
const DRAIN_MAX_LINES: usize = 10_000;

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Spawns the configured server command.
pub struct CommandLauncher {
    config: ServerConfig,
}

impl CommandLauncher {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }
}

impl CommandLauncher {
    /// Spawn and warm up one server instance.
    async fn spawn(&self) -> Result<ChildProcess, ClientError> {
        let cfg = &self.config;
        let mut cmd = Command::new(&cfg.command);
        cmd.args(&cfg.args)
            .envs(cfg.process_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // npx and friends fork the real server; own the whole group so
        // shutdown reaches it.
        #[cfg(unix)]
        cmd.process_group(0);

        info!("Spawning vision server: {} {}", cfg.command, cfg.args.join(" "));
        let mut child = cmd.spawn().map_err(|e| ClientError::Launch {
            message: format!(
                "failed to spawn '{}': {e}. Is it installed and in PATH?",
                cfg.command
            ),
            stderr: Vec::new(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| launch_error("stdin not captured"))?;
        let stdout = child.stdout.take().ok_or_else(|| launch_error("stdout not captured"))?;
        let tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(stderr, tail.clone())));

        tokio::time::sleep(cfg.warmup()).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                // Let the stderr reader collect what the process left behind.
                if let Some(task) = stderr_task {
                    let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
                }
                let stderr = snapshot(&tail);
                error!(
                    "Vision server exited during warm-up ({status}); last stderr: {}",
                    stderr.join(" | ")
                );
                return Err(ClientError::Launch {
                    message: format!("server exited during warm-up with {status}"),
                    stderr,
                });
            }
            Err(e) => return Err(launch_error(&format!("liveness probe failed: {e}"))),
        }

        let pid = child.id();
        info!("Vision server started (pid {})", pid.unwrap_or(0));
        Ok(ChildProcess {
            child,
            pid,
            writer: Some(FramedWrite::new(stdin, LinesCodec::new())),
            reader: FramedRead::new(
                stdout,
                LinesCodec::new_with_max_length(cfg.max_line_bytes),
            ),
            resume_after_error: false,
            stderr_task,
            max_line_bytes: cfg.max_line_bytes,
        })
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self) -> Result<Box<dyn Transport>, ClientError> {
        Ok(Box::new(self.spawn().await?))
    }
}

/// A running server subprocess with framed pipes.
pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    /// `None` once stdin has been closed for shutdown.
    writer: Option<FramedWrite<ChildStdin, LinesCodec>>,
    reader: FramedRead<ChildStdout, LinesCodec>,
    /// `FramedRead` yields one `None` after a decode error before it
    /// resumes reading; that `None` is not end of stream.
    resume_after_error: bool,
    stderr_task: Option<JoinHandle<()>>,
    max_line_bytes: usize,
}

impl ChildProcess {
    /// Next frame from stdout, stepping over the pause after a codec error.
    async fn next_frame(&mut self) -> Option<Result<String, LinesCodecError>> {
        loop {
            let frame = self.reader.next().await;
            match &frame {
                None if self.resume_after_error => {
                    self.resume_after_error = false;
                    continue;
                }
                Some(Err(_)) => self.resume_after_error = true,
                _ => self.resume_after_error = false,
            }
            return frame;
        }
    }

    /// Signal the server's process group. Nothing is sent once the child has
    /// been reaped: its pid may belong to someone else by now.
    #[cfg(unix)]
    fn signal_group(&mut self, signal: libc::c_int) -> bool {
        if !matches!(self.child.try_wait(), Ok(None)) {
            return false;
        }
        let Some(pid) = self.pid else {
            return false;
        };
        unsafe { libc::kill(-(pid as i32), signal) == 0 }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: i32) -> bool {
        false
    }

    fn terminate_group(&mut self) -> bool {
        #[cfg(unix)]
        let signal = libc::SIGTERM;
        #[cfg(not(unix))]
        let signal = 15;
        self.signal_group(signal)
    }

    fn kill_group(&mut self) -> bool {
        #[cfg(unix)]
        let signal = libc::SIGKILL;
        #[cfg(not(unix))]
        let signal = 9;
        self.signal_group(signal)
    }
}

#[async_trait]
impl Transport for ChildProcess {
    async fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        let writer = self.writer.as_mut().ok_or(ClientError::NotConnected)?;
        writer.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(e) => ClientError::Transport(format!("write to server stdin: {e}")),
            other => ClientError::Transport(other.to_string()),
        })
    }

    async fn recv_line(&mut self) -> Result<Option<String>, ClientError> {
        match self.next_frame().await {
            None => Ok(None),
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(ClientError::Protocol(
                format!("line exceeds {} bytes", self.max_line_bytes),
            )),
            Some(Err(LinesCodecError::Io(e))) => {
                Err(ClientError::Transport(format!("read from server stdout: {e}")))
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn drain(&mut self) -> usize {
        let mut drained = 0;
        while drained < DRAIN_MAX_LINES {
            match tokio::time::timeout(DRAIN_POLL, self.next_frame()).await {
                Ok(Some(Ok(line))) => {
                    debug!("Drained buffered line: {}", truncate(&line, 120));
                    drained += 1;
                }
                Ok(Some(Err(_))) => drained += 1,
                Ok(None) | Err(_) => break,
            }
        }
        drained
    }

    async fn shutdown(&mut self, grace: Duration) {
        // Closing stdin is the polite way to end a stdio server.
        if let Some(mut writer) = self.writer.take() {
            let _ = SinkExt::<&str>::close(&mut writer).await;
        }
        self.terminate_group();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!("Vision server exited ({status})"),
            Ok(Err(e)) => warn!("Waiting for vision server failed: {e}"),
            Err(_) => {
                warn!(
                    "Vision server did not exit within {}ms, killing",
                    grace.as_millis()
                );
                self.kill_group();
                if let Err(e) = self.child.kill().await {
                    warn!("Kill failed: {e}");
                }
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

async fn forward_stderr(stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        warn!("vision server stderr: {line}");
        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

fn snapshot(tail: &StderrTail) -> Vec<String> {
    tail.lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect()
}

fn launch_error(message: &str) -> ClientError {
    ClientError::Launch {
        message: message.to_string(),
        stderr: Vec::new(),
    }
}
