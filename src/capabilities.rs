use std::time::Duration;

use serde_json::json;
use tracing::info;

use crate::correlator::RequestCorrelator;
use crate::error::ClientError;
use crate::protocol::{CapabilityDescriptor, METHOD_LIST_TOOLS, parse_capabilities};
use crate::transport::Transport;

/// The server's tool list, fetched once per server lifetime.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    tools: Vec<CapabilityDescriptor>,
    fetched: bool,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    pub fn tools(&self) -> &[CapabilityDescriptor] {
        &self.tools
    }

    pub fn clear(&mut self) {
        self.tools.clear();
        self.fetched = false;
    }

    /// Fetch the tool list unless this lifetime already has it.
    /// On failure the cache stays unfetched so the next call retries.
    pub async fn ensure(
        &mut self,
        correlator: &mut RequestCorrelator,
        transport: &mut dyn Transport,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        if self.fetched {
            return Ok(());
        }
        let tools = self.fetch(correlator, transport, timeout).await?;
        info!(
            "Vision server offers {} tools: {}",
            tools.len(),
            tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        self.tools = tools;
        self.fetched = true;
        Ok(())
    }

    async fn fetch(
        &self,
        correlator: &mut RequestCorrelator,
        transport: &mut dyn Transport,
        timeout: Duration,
    ) -> Result<Vec<CapabilityDescriptor>, ClientError> {
        let out = correlator
            .send(transport, METHOD_LIST_TOOLS, json!({}), timeout)
            .await?;
        if let Some(err) = out.response.error {
            return Err(ClientError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        let result = out
            .response
            .result
            .ok_or_else(|| ClientError::Protocol("tools/list response has no result".to_string()))?;
        parse_capabilities(&result)
    }
}
