use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ClientError;

/// First id handed out after every (re)start.
pub const INITIAL_REQUEST_ID: u64 = 1;

pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";

// ── Wire format: one JSON object per line, both directions ──

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }

    /// Serialize as a single line (no trailing newline; the codec adds it).
    pub fn to_line(&self) -> Result<String, ClientError> {
        serde_json::to_string(self)
            .map_err(|e| ClientError::Protocol(format!("failed to encode request: {e}")))
    }
}

/// A response line. `id` is absent on server notifications, which are
/// treated like any other non-matching line.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl RpcResponse {
    /// Parse one line. Anything that isn't a JSON object is a protocol error.
    pub fn parse(line: &str) -> Result<Self, ClientError> {
        Self::from_value(parse_object(line)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ClientError> {
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("malformed response: {e}")))
    }
}

/// Decode a line as a JSON object without interpreting its members.
pub fn parse_object(line: &str) -> Result<Value, ClientError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| ClientError::Protocol(format!("unparseable line: {e}")))?;
    if !value.is_object() {
        return Err(ClientError::Protocol(format!(
            "expected a JSON object, got: {}",
            truncate(line, 120)
        )));
    }
    Ok(value)
}

/// The numeric id of a response object. String, negative or missing ids are `None`.
pub fn response_id(value: &Value) -> Option<u64> {
    value.get("id").and_then(Value::as_u64)
}

/// One operation the server says it can perform.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", skip_serializing_if = "Value::is_null")]
    pub input_schema: Value,
}

/// Extract descriptors from a `tools/list` result.
pub fn parse_capabilities(result: &Value) -> Result<Vec<CapabilityDescriptor>, ClientError> {
    let Some(tools) = result.get("tools").and_then(Value::as_array) else {
        return Err(ClientError::Protocol(
            "tools/list result has no tools array".to_string(),
        ));
    };
    tools
        .iter()
        .map(|t| {
            serde_json::from_value(t.clone())
                .map_err(|e| ClientError::Protocol(format!("bad tool descriptor: {e}")))
        })
        .collect()
}

/// An image on disk plus the instruction to apply to it.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub image: PathBuf,
    pub prompt: String,
}

impl AnalysisRequest {
    pub fn new(image: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            prompt: prompt.into(),
        }
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
