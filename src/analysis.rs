use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::AnalysisConfig;
use crate::correlator::RequestCorrelator;
use crate::error::ClientError;
use crate::protocol::{AnalysisRequest, CapabilityDescriptor, METHOD_CALL_TOOL, truncate};
use crate::transport::Transport;

/// JSON-RPC "server error" code used when the tool itself flags a failure.
pub const TOOL_ERROR_CODE: i64 = -32000;

/// Vocabulary of tool listings and JSON schemas. Real image descriptions
/// don't contain these.
const SCHEMA_MARKERS: &[&str] = &[
    "inputSchema",
    "\"properties\"",
    "\"required\"",
    "tools/list",
    "tools/call",
];

/// Flat result fields some servers use instead of content blocks.
const FLAT_TEXT_FIELDS: &[&str] = &["description", "analysis", "text"];

/// Tool names shorter than this are too likely to show up in real text.
const MIN_TOOL_NAME_MARKER: usize = 6;

/// Every raw `tools/call` result lands in exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    /// Usable analysis text.
    Text(String),
    /// The result is shaped like a tool listing.
    CatalogEcho,
    /// Text that quotes capability descriptions instead of describing the image.
    Contaminated { marker: String },
    /// The server marked its own tool result as an error.
    ToolError(String),
    /// Nothing usable in the result.
    Empty(String),
}

impl AnalysisOutcome {
    /// Only `Text` is a success; the rest are attempt failures.
    pub fn into_text(self) -> Result<String, ClientError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::CatalogEcho => Err(ClientError::Semantic(
                "result is a capability listing, not image analysis".to_string(),
            )),
            Self::Contaminated { marker } => Err(ClientError::Semantic(format!(
                "result contains capability text ({marker})"
            ))),
            Self::ToolError(message) => Err(ClientError::Remote {
                code: TOOL_ERROR_CODE,
                message,
            }),
            Self::Empty(why) => Err(ClientError::Protocol(why)),
        }
    }
}

/// Builds `tools/call` requests for the analysis tool and classifies results.
#[derive(Debug, Clone)]
pub struct AnalysisInvoker {
    tool: String,
    image_argument: String,
    extra_markers: Vec<String>,
}

impl AnalysisInvoker {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            tool: config.tool.clone(),
            image_argument: config.image_argument.clone(),
            extra_markers: config.contamination_markers.clone(),
        }
    }

    pub fn params(&self, request: &AnalysisRequest) -> Value {
        let mut arguments = serde_json::Map::new();
        arguments.insert(
            self.image_argument.clone(),
            Value::String(request.image.to_string_lossy().to_string()),
        );
        arguments.insert("prompt".to_string(), Value::String(request.prompt.clone()));
        json!({ "name": self.tool, "arguments": arguments })
    }

    /// One round trip: send the call, then classify whatever comes back.
    pub async fn invoke(
        &self,
        correlator: &mut RequestCorrelator,
        transport: &mut dyn Transport,
        request: &AnalysisRequest,
        capabilities: &[CapabilityDescriptor],
        timeout: Duration,
    ) -> Result<String, ClientError> {
        let out = correlator
            .send(transport, METHOD_CALL_TOOL, self.params(request), timeout)
            .await?;
        if let Some(err) = out.response.error {
            return Err(ClientError::Remote {
                code: err.code,
                message: err.message,
            });
        }
        let Some(result) = out.response.result else {
            return Err(ClientError::Protocol(
                "response has neither result nor error".to_string(),
            ));
        };

        let outcome = self.classify(&result, capabilities);
        match &outcome {
            AnalysisOutcome::Text(text) => {
                debug!("Analysis text ({} chars): {}", text.len(), truncate(text, 200))
            }
            other => warn!(
                "Rejected analysis result {other:?}: {}",
                truncate(&result.to_string(), 200)
            ),
        }
        outcome.into_text()
    }

    pub fn classify(&self, result: &Value, capabilities: &[CapabilityDescriptor]) -> AnalysisOutcome {
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let message = extract_text(result)
                .unwrap_or_else(|| "tool reported an error".to_string());
            return AnalysisOutcome::ToolError(message);
        }
        if result.get("tools").is_some_and(Value::is_array) {
            return AnalysisOutcome::CatalogEcho;
        }
        let Some(text) = extract_text(result) else {
            return AnalysisOutcome::Empty(format!(
                "no text in result: {}",
                truncate(&result.to_string(), 120)
            ));
        };
        match self.contamination(&text, capabilities) {
            Some(marker) => AnalysisOutcome::Contaminated { marker },
            None => AnalysisOutcome::Text(text),
        }
    }

    fn contamination(&self, text: &str, capabilities: &[CapabilityDescriptor]) -> Option<String> {
        let schema = SCHEMA_MARKERS.iter().map(|m| m.to_string());
        let configured = self.extra_markers.iter().cloned();
        let tool_names = capabilities
            .iter()
            .map(|c| c.name.as_str())
            .filter(|name| {
                *name != self.tool && name.len() >= MIN_TOOL_NAME_MARKER && name.contains('_')
            })
            .map(str::to_string);
        schema
            .chain(configured)
            .chain(tool_names)
            .filter(|m| !m.is_empty())
            .find(|m| text.contains(m.as_str()))
    }
}

/// Text from `content` blocks, falling back to a flat field.
fn extract_text(result: &Value) -> Option<String> {
    if let Some(blocks) = result.get("content").and_then(Value::as_array) {
        let texts: Vec<&str> = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if !texts.is_empty() {
            return Some(texts.join("\n"));
        }
    }
    FLAT_TEXT_FIELDS
        .iter()
        .filter_map(|key| result.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
