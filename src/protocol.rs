//! MCP wire types: JSON-RPC 2.0 envelopes plus the initialize, tools and
//! resources payloads a grocery server exchanges with its client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{codes, Error};

/// Value of the `jsonrpc` member.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Absent for notifications.
    pub id: Option<JsonRpcId>,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request answered; `None` when the request could not be read.
    pub id: Option<JsonRpcId>,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Payload on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful response carrying `result`.
    pub fn success(id: Option<JsonRpcId>, result: impl Serialize) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
        }
    }

    /// Error response.
    pub fn error(id: Option<JsonRpcId>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC error member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// See [`Error::code`].
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Extra detail; this server never sets it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Request id, either form allowed by JSON-RPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum JsonRpcId {
    /// `"id": "abc"`.
    String(String),
    /// `"id": 7`.
    Number(i64),
}

/// One decoded line (or HTTP body) from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpMessage {
    /// Expects a response.
    Request(JsonRpcRequest),
    /// A response to something we sent; ignored.
    Response(JsonRpcResponse),
    /// Request without an id.
    Notification(JsonRpcRequest),
}

impl McpMessage {
    /// Classify and decode a raw message.
    pub fn parse(json: &str) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(json)?;

        let is_request = value.get("method").is_some();
        let is_response = value.get("result").is_some() || value.get("error").is_some();
        match (is_request, is_response) {
            (true, _) => {
                let request: JsonRpcRequest = serde_json::from_value(value)?;
                Ok(match request.id {
                    Some(_) => McpMessage::Request(request),
                    None => McpMessage::Notification(request),
                })
            }
            (false, true) => Ok(McpMessage::Response(serde_json::from_value(value)?)),
            (false, false) => Err(Error::JsonRpc {
                code: codes::INVALID_REQUEST,
                message: "message is neither a request nor a response".into(),
            }),
        }
    }
}

// ============================================================================
// initialize
// ============================================================================

/// `initialize` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol revision the client speaks.
    pub protocol_version: String,
    /// What the client supports.
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    /// Client name and version, logged on connect.
    pub client_info: ClientInfo,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol revision the server speaks.
    pub protocol_version: String,
    /// What the server offers.
    pub capabilities: ServerCapabilities,
    /// `<site>-mcp` and the crate version.
    pub server_info: ServerInfo,
}

/// Client capabilities. Recorded but not acted on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Filesystem roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,
    /// LLM sampling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

/// Server capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Present: the ten site tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    /// Present: cart and orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    /// Not offered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

/// Tools capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    /// The tool set is fixed per site.
    #[serde(default)]
    pub list_changed: bool,
}

/// Resources capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapability {
    /// Subscriptions are not supported.
    #[serde(default)]
    pub subscribe: bool,
    /// No change notifications are sent.
    #[serde(default)]
    pub list_changed: bool,
}

/// Client name and version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// e.g. `vscode`.
    pub name: String,
    /// Free-form version string.
    pub version: String,
}

/// Server name and version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// e.g. `sklavenitis-mcp`.
    pub name: String,
    /// Crate version.
    pub version: String,
}

// ============================================================================
// tools
// ============================================================================

/// One entry of `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// `<site>_<operation>`.
    pub name: String,
    /// Shown to the model.
    pub description: String,
    /// JSON Schema of the arguments object.
    pub input_schema: Value,
}

/// `tools/call` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    /// Tool to run.
    pub name: String,
    /// Arguments object; missing means none.
    #[serde(default)]
    pub arguments: Value,
}

/// `tools/call` result. Site failures set `is_error` instead of failing the
/// JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Markdown text blocks.
    pub content: Vec<ContentItem>,
    /// The operation failed on the site side.
    #[serde(default)]
    pub is_error: bool,
}

/// Content block of a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentItem {
    /// Markdown text.
    Text {
        /// The text.
        text: String,
    },
}

impl ContentItem {
    /// Text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text { text: text.into() }
    }
}

impl ToolCallResult {
    /// Successful result with one text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: false,
        }
    }

    /// Failed result with one text block.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentItem::text(text)],
            is_error: true,
        }
    }
}

/// `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    /// Sorted by name.
    pub tools: Vec<ToolDefinition>,
}

// ============================================================================
// resources
// ============================================================================

/// One entry of `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// e.g. `skroutz://cart`.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// One-line description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Always JSON here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// `resources/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResourcesResult {
    /// Empty while logged out.
    pub resources: Vec<ResourceDefinition>,
}

/// `resources/read` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceParams {
    /// Resource to read.
    pub uri: String,
}

/// Body of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    /// Resource read.
    pub uri: String,
    /// Content type of `text`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Pretty-printed JSON.
    pub text: String,
}

/// `resources/read` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResourceResult {
    /// A single entry.
    pub contents: Vec<ResourceContents>,
}
