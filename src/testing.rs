//! Scripted stand-ins for the vision server, used by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::error::ClientError;
use crate::transport::{Launcher, Transport};

/// A request as the fake server saw it.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// What the fake server does in response to one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Now(String),
    After(Duration, String),
    Close,
}

pub type Responder = Box<dyn FnMut(&Request) -> Vec<Reply> + Send>;

pub fn responder(f: impl FnMut(&Request) -> Vec<Reply> + Send + 'static) -> Responder {
    Box::new(f)
}

pub fn result(id: u64, result: Value) -> Reply {
    Reply::Now(json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
}

pub fn text_result(id: u64, text: &str) -> Reply {
    result(id, json!({"content": [{"type": "text", "text": text}]}))
}

pub fn tool_list(id: u64) -> Reply {
    result(
        id,
        json!({"tools": [
            {"name": "image_analysis", "description": "Analyze an image",
             "inputSchema": {"type": "object", "properties": {"image_source": {"type": "string"}}}},
            {"name": "extract_text_from_screenshot", "description": "OCR"}
        ]}),
    )
}

/// Ordered record of writes and deliveries shared across server lifetimes.
pub type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug)]
enum Scripted {
    Line {
        text: String,
        delay: Option<Duration>,
        ready_at: Option<Instant>,
    },
    Close,
}

pub struct ScriptedTransport {
    inbox: VecDeque<Scripted>,
    written: Vec<String>,
    log: EventLog,
    responder: Option<Responder>,
    alive: bool,
    shutdowns: Arc<AtomicUsize>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            inbox: VecDeque::new(),
            written: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            responder: None,
            alive: true,
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_responder(responder: Responder) -> Self {
        Self {
            responder: Some(responder),
            ..Self::new()
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.inbox.push_back(Scripted::Line {
            text: line.to_string(),
            delay: None,
            ready_at: None,
        });
    }

    /// Deliver `line` once `delay` has passed since the reader started waiting for it.
    pub fn push_line_after(&mut self, delay: Duration, line: &str) {
        self.inbox.push_back(Scripted::Line {
            text: line.to_string(),
            delay: Some(delay),
            ready_at: None,
        });
    }

    pub fn close(&mut self) {
        self.inbox.push_back(Scripted::Close);
    }

    pub fn written(&self) -> &[String] {
        &self.written
    }

    fn record(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }

    fn enqueue(&mut self, reply: Reply) {
        match reply {
            Reply::Now(line) => self.push_line(&line),
            Reply::After(delay, line) => self.push_line_after(delay, &line),
            Reply::Close => self.close(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), ClientError> {
        if !self.alive {
            return Err(ClientError::Transport("broken pipe".to_string()));
        }
        self.written.push(line.to_string());
        self.record(format!("W {line}"));
        let v: Value = serde_json::from_str(line).expect("client wrote invalid JSON");
        let request = Request {
            id: v["id"].as_u64().expect("request without id"),
            method: v["method"].as_str().unwrap_or_default().to_string(),
            params: v["params"].clone(),
        };
        if let Some(responder) = self.responder.as_mut() {
            for reply in responder(&request) {
                self.enqueue(reply);
            }
        }
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<Option<String>, ClientError> {
        loop {
            match self.inbox.front_mut() {
                None => std::future::pending::<()>().await,
                Some(Scripted::Close) => {
                    self.alive = false;
                    return Ok(None);
                }
                Some(Scripted::Line {
                    delay, ready_at, ..
                }) => {
                    if let Some(delay) = *delay {
                        // Survives cancellation: the wait resumes where it stopped.
                        let at = *ready_at.get_or_insert_with(|| Instant::now() + delay);
                        tokio::time::sleep_until(at).await;
                    }
                    if let Some(Scripted::Line { text, .. }) = self.inbox.pop_front() {
                        self.record(format!("R {text}"));
                        return Ok(Some(text));
                    }
                }
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    async fn drain(&mut self) -> usize {
        let mut n = 0;
        while let Some(Scripted::Line { delay: None, .. }) = self.inbox.front() {
            self.inbox.pop_front();
            n += 1;
        }
        n
    }

    async fn shutdown(&mut self, _grace: Duration) {
        self.alive = false;
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out scripted transports, one responder per launch.
pub struct ScriptedLauncher {
    make: Box<dyn Fn(usize) -> Responder + Send + Sync>,
    launches: Arc<AtomicUsize>,
    failing: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
    log: EventLog,
}

impl ScriptedLauncher {
    /// `make` receives the launch index (0 for the first launch).
    pub fn new(make: impl Fn(usize) -> Responder + Send + Sync + 'static) -> Self {
        Self {
            make: Box::new(make),
            launches: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The next `n` launches fail as if the server died during warm-up.
    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    pub fn probe(&self) -> LauncherProbe {
        LauncherProbe {
            launches: self.launches.clone(),
            shutdowns: self.shutdowns.clone(),
            log: self.log.clone(),
        }
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self) -> Result<Box<dyn Transport>, ClientError> {
        if self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::Launch {
                message: "server exited during warm-up".to_string(),
                stderr: vec!["Z_AI_API_KEY is not set".to_string()],
            });
        }
        let index = self.launches.fetch_add(1, Ordering::SeqCst);
        let mut transport = ScriptedTransport::with_responder((self.make)(index));
        transport.log = self.log.clone();
        transport.shutdowns = self.shutdowns.clone();
        Ok(Box::new(transport))
    }
}

/// Read-only view of a launcher's counters that outlives moving it into a client.
#[derive(Clone)]
pub struct LauncherProbe {
    launches: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
    log: EventLog,
}

impl LauncherProbe {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Parsed requests in the order they were written, across all launches.
    pub fn requests(&self) -> Vec<Request> {
        self.events()
            .iter()
            .filter_map(|e| e.strip_prefix("W "))
            .map(|line| {
                let v: Value = serde_json::from_str(line).unwrap();
                Request {
                    id: v["id"].as_u64().unwrap(),
                    method: v["method"].as_str().unwrap().to_string(),
                    params: v["params"].clone(),
                }
            })
            .collect()
    }
}
