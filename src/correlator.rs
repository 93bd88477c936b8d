use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ClientError;
use crate::protocol::{
    INITIAL_REQUEST_ID, RpcRequest, RpcResponse, parse_object, response_id, truncate,
};
use crate::transport::Transport;

/// The request currently awaiting its answer.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub deadline: Instant,
}

/// The matching response plus how many stale lines were skipped to reach it.
#[derive(Debug)]
pub struct Correlated {
    pub response: RpcResponse,
    pub drained: usize,
}

/// Pairs each request line with its response line by id.
///
/// Earlier calls may have timed out while the server kept working; their
/// late answers then sit in the pipe ahead of ours. Those are discarded
/// here. All waiting, drained lines included, shares one deadline.
#[derive(Debug)]
pub struct RequestCorrelator {
    next_id: u64,
    stale_total: u64,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: INITIAL_REQUEST_ID,
            stale_total: 0,
        }
    }

    /// Back to the initial id. Only for a fresh server lifetime.
    pub fn reset(&mut self) {
        self.next_id = INITIAL_REQUEST_ID;
    }

    /// The id the next request will carry.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Stale lines drained since this client was created.
    pub fn stale_total(&self) -> u64 {
        self.stale_total
    }

    fn allocate(&mut self, method: &str, timeout: Duration) -> PendingRequest {
        let id = self.next_id;
        self.next_id += 1;
        PendingRequest {
            id,
            method: method.to_string(),
            deadline: Instant::now() + timeout,
        }
    }

    pub async fn send(
        &mut self,
        transport: &mut dyn Transport,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Correlated, ClientError> {
        let pending = self.allocate(method, timeout);
        let line = RpcRequest::new(pending.id, method, params).to_line()?;
        debug!("-> id={} {method}", pending.id);
        transport.send_line(&line).await?;

        let mut drained = 0;
        loop {
            let next = tokio::time::timeout_at(pending.deadline, transport.recv_line()).await;
            let line = match next {
                Err(_) => {
                    return Err(ClientError::Timeout {
                        method: pending.method,
                        after: timeout,
                        drained,
                    });
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(None)) => {
                    return Err(ClientError::Transport(
                        "server closed its output stream".to_string(),
                    ));
                }
                Ok(Ok(Some(line))) => line,
            };
            if line.trim().is_empty() {
                continue;
            }

            // Only the id decides; the rest of a stale line may have any shape.
            let value = parse_object(&line)?;
            if response_id(&value) == Some(pending.id) {
                let response = RpcResponse::from_value(value)?;
                debug!("<- id={} ({drained} drained)", pending.id);
                return Ok(Correlated { response, drained });
            }

            drained += 1;
            self.stale_total += 1;
            info!(
                "Stale response drained (got id={}, want id={}, total drained={}): {}",
                value.get("id").map_or_else(|| "none".to_string(), serde_json::Value::to_string),
                pending.id,
                self.stale_total,
                truncate(&line, 120)
            );
        }
    }
}
