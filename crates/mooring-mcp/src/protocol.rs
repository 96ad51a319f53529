//! MCP (Model Context Protocol) JSON-RPC 2.0 message types.

use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    /// Always the literal `"2.0"`.
    pub jsonrpc: &'static str,
    /// Request id; responses carry it back.
    pub id: u64,
    /// Method name, e.g. `tools/list`.
    pub method: String,
    /// Method parameters, omitted when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Creates a request for `method` with the given id and parameters.
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version echoed by the server.
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// The id of the request this answers; `None` for notifications.
    pub id: Option<u64>,
    /// Successful result payload.
    pub result: Option<serde_json::Value>,
    /// Error payload, mutually exclusive with `result`.
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional structured error detail.
    pub data: Option<serde_json::Value>,
}

/// Tool definition from the `tools/list` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolDescriptor {
    /// Tool name, unique within one server.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON schema for the tool's arguments.
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Resource definition from the `resources/list` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourceDescriptor {
    /// Resource URI.
    pub uri: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// MIME type, when the server reports one.
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
}

/// Tool call result from the `tools/call` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallResult {
    /// Content blocks produced by the tool.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Whether the tool reported failure.
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// A single content block inside a tool result.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentBlock {
    /// Block type, e.g. `text`.
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text payload for `text` blocks.
    #[serde(default)]
    pub text: String,
}

/// Server capabilities from the `initialize` response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Present when the server exposes tools.
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
    /// Present when the server exposes resources.
    #[serde(default)]
    pub resources: Option<serde_json::Value>,
}

/// The `initialize` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    /// Protocol version the server speaks.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Server identity, when reported.
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerIdentity>,
}

/// Server name and version from the `initialize` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerIdentity {
    /// Server name.
    pub name: String,
    /// Server version string.
    #[serde(default)]
    pub version: String,
}
