//! MCP server for one grocery site: request dispatch, the initialize
//! handshake and the cart/orders resources.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;

use crate::error::{codes, Error, Result};
use crate::models::SessionStatus;
use crate::protocol::{
    ClientCapabilities, InitializeParams, InitializeResult, JsonRpcId, JsonRpcRequest,
    JsonRpcResponse, ListResourcesResult, ListToolsResult, McpMessage, ReadResourceParams,
    ReadResourceResult, ResourceContents, ResourceDefinition, ResourcesCapability,
    ServerCapabilities, ServerInfo, ToolCallParams, ToolsCapability,
};
use crate::sites::Storefront;
use crate::tools::{ToolContext, ToolRegistry};

/// MCP protocol version.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server name.
pub const SERVER_NAME: &str = "grocery-mcp";

/// Server version.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const JSON_MIME: &str = "application/json";

/// MCP server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Before `initialize`.
    Uninitialized,
    /// Serving requests.
    Ready,
    /// After `shutdown` or `exit`.
    ShuttingDown,
}

/// MCP server for one grocery site.
pub struct McpServer {
    state: Arc<RwLock<ServerState>>,
    tools: Arc<ToolRegistry>,
    client_capabilities: Arc<RwLock<Option<ClientCapabilities>>>,
}

impl McpServer {
    /// Create a server around a storefront.
    pub fn new(storefront: Storefront) -> Self {
        Self::with_registry(ToolRegistry::new(Arc::new(ToolContext::new(storefront))))
    }

    /// Create a server with a prepared tool registry.
    pub fn with_registry(tools: ToolRegistry) -> Self {
        Self {
            state: Arc::new(RwLock::new(ServerState::Uninitialized)),
            tools: Arc::new(tools),
            client_capabilities: Arc::new(RwLock::new(None)),
        }
    }

    /// Current state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Capabilities the client announced in `initialize`.
    pub async fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.client_capabilities.read().await.clone()
    }

    /// Session snapshot of the served site.
    pub async fn session_status(&self) -> SessionStatus {
        self.tools.context().storefront().await.status()
    }

    fn display_name(&self) -> String {
        format!("{}-mcp", self.tools.context().site().slug())
    }

    /// Serve newline-delimited JSON-RPC on stdin/stdout until `shutdown`,
    /// `exit` or end of input.
    pub async fn run_stdio(&self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        tracing::info!(server = %self.display_name(), "MCP server starting on stdio");

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            tracing::debug!("Received: {}", line);

            if let Some(response) = self.handle_message(line).await {
                let json = serde_json::to_string(&response)?;
                tracing::debug!("Sending: {}", json);
                stdout.write_all(json.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }

            if *self.state.read().await == ServerState::ShuttingDown {
                break;
            }
        }

        tracing::info!("MCP server shutting down");
        Ok(())
    }

    /// Handle one raw message. Returns `None` for notifications and for
    /// responses from the client.
    pub async fn handle_message(&self, json: &str) -> Option<JsonRpcResponse> {
        match McpMessage::parse(json) {
            Ok(McpMessage::Request(request)) => Some(self.handle_request(request).await),
            Ok(McpMessage::Notification(notification)) => {
                self.handle_notification(notification).await;
                None
            }
            Ok(McpMessage::Response(_)) => None,
            Err(e) => Some(JsonRpcResponse::error(None, e.code(), e.to_string())),
        }
    }

    /// Dispatch a request by method.
    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();

        match request.method.as_str() {
            "initialize" => self.handle_initialize(id, request.params).await,
            "tools/list" => self.handle_tools_list(id).await,
            "tools/call" => self.handle_tools_call(id, request.params).await,
            "resources/list" => self.handle_resources_list(id).await,
            "resources/read" => self.handle_resources_read(id, request.params).await,
            "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
            "shutdown" => {
                *self.state.write().await = ServerState::ShuttingDown;
                JsonRpcResponse::success(id, serde_json::json!({}))
            }
            _ => JsonRpcResponse::error(
                id,
                codes::METHOD_NOT_FOUND,
                format!("method not found: {}", request.method),
            ),
        }
    }

    /// Notifications never get a response.
    async fn handle_notification(&self, notification: JsonRpcRequest) {
        match notification.method.as_str() {
            "notifications/initialized" => {
                tracing::info!("Client initialized");
            }
            "notifications/cancelled" => {
                tracing::debug!("Request cancelled by client");
            }
            "exit" => {
                *self.state.write().await = ServerState::ShuttingDown;
            }
            _ => {
                tracing::debug!("Unknown notification: {}", notification.method);
            }
        }
    }

    async fn ensure_ready(&self, id: &Option<JsonRpcId>) -> Option<JsonRpcResponse> {
        if *self.state.read().await == ServerState::Ready {
            None
        } else {
            Some(JsonRpcResponse::error(
                id.clone(),
                codes::INTERNAL_ERROR,
                "server not initialized",
            ))
        }
    }

    /// Record the client's capabilities and move to `Ready`.
    async fn handle_initialize(
        &self,
        id: Option<JsonRpcId>,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        let params: InitializeParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid initialize params: {}", e),
                );
            }
            None => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    "initialize params required",
                );
            }
        };

        tracing::info!(
            client = %params.client_info.name,
            version = %params.client_info.version,
            protocol = %params.protocol_version,
            "initialize"
        );
        *self.client_capabilities.write().await = Some(params.capabilities);
        *self.state.write().await = ServerState::Ready;

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                resources: Some(ResourcesCapability {
                    subscribe: false,
                    list_changed: false,
                }),
                logging: None,
            },
            server_info: ServerInfo {
                name: self.display_name(),
                version: SERVER_VERSION.into(),
            },
        };

        JsonRpcResponse::success(id, result)
    }

    async fn handle_tools_list(&self, id: Option<JsonRpcId>) -> JsonRpcResponse {
        if let Some(response) = self.ensure_ready(&id).await {
            return response;
        }

        let result = ListToolsResult {
            tools: self.tools.list_tools(),
        };

        JsonRpcResponse::success(id, result)
    }

    async fn handle_tools_call(
        &self,
        id: Option<JsonRpcId>,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        if let Some(response) = self.ensure_ready(&id).await {
            return response;
        }

        let params: ToolCallParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid tool call params: {}", e),
                );
            }
            None => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    "tool call params required",
                );
            }
        };

        match self.tools.execute(&params.name, params.arguments).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => {
                tracing::error!("Tool {} failed: {}", params.name, e);
                JsonRpcResponse::error(id, e.code(), e.to_string())
            }
        }
    }

    /// Handle resources/list request. Cart and orders are listed only while
    /// a session is held.
    async fn handle_resources_list(&self, id: Option<JsonRpcId>) -> JsonRpcResponse {
        if let Some(response) = self.ensure_ready(&id).await {
            return response;
        }

        let context = self.tools.context();
        let site = context.site();
        let authenticated = context.storefront().await.session().is_authenticated();

        let resources = if authenticated {
            vec![
                ResourceDefinition {
                    uri: format!("{}://cart", site.slug()),
                    name: format!("{} cart", site),
                    description: Some("Current shopping cart".into()),
                    mime_type: Some(JSON_MIME.into()),
                },
                ResourceDefinition {
                    uri: format!("{}://orders", site.slug()),
                    name: format!("{} orders", site),
                    description: Some("Order history".into()),
                    mime_type: Some(JSON_MIME.into()),
                },
            ]
        } else {
            Vec::new()
        };

        JsonRpcResponse::success(id, ListResourcesResult { resources })
    }

    /// Handle resources/read request.
    async fn handle_resources_read(
        &self,
        id: Option<JsonRpcId>,
        params: Option<serde_json::Value>,
    ) -> JsonRpcResponse {
        if let Some(response) = self.ensure_ready(&id).await {
            return response;
        }

        let params: ReadResourceParams = match params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("invalid resource params: {}", e),
                );
            }
            None => {
                return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "resource uri required");
            }
        };

        match self.read_resource(&params.uri).await {
            Ok(text) => JsonRpcResponse::success(
                id,
                ReadResourceResult {
                    contents: vec![ResourceContents {
                        uri: params.uri,
                        mime_type: Some(JSON_MIME.into()),
                        text,
                    }],
                },
            ),
            Err(e) => {
                tracing::warn!(uri = %params.uri, error = %e, "resource read failed");
                JsonRpcResponse::error(id, e.code(), e.to_string())
            }
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<String> {
        let context = self.tools.context();
        let slug = context.site().slug();
        let path = uri
            .strip_prefix(slug)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(|| Error::InvalidParams(format!("unknown resource: {}", uri)))?;

        let mut storefront = context.storefront().await;
        if !storefront.session().is_authenticated() {
            return Err(Error::AuthenticationRequired(format!(
                "log in to {} before reading {}",
                context.site(),
                uri
            )));
        }

        match path {
            "cart" => Ok(serde_json::to_string_pretty(&storefront.get_cart().await?)?),
            "orders" => Ok(serde_json::to_string_pretty(&storefront.get_orders(true, false).await?)?),
            _ => Err(Error::InvalidParams(format!("unknown resource: {}", uri))),
        }
    }
}
