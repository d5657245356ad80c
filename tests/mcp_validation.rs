//! MCP server validation tests.
//!
//! Drives the real binary over stdio: JSON-RPC 2.0 framing, the initialize
//! handshake, tool listing and clean shutdown. Nothing here touches the
//! network; the server runs with no credentials and an empty home.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

// JSON-RPC 2.0 types
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl JsonRpcRequest {
    fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    #[allow(dead_code)]
    message: String,
}

/// MCP test client for validating the server.
struct McpTestClient {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    _home: TempDir,
}

impl McpTestClient {
    async fn spawn(site: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let home = TempDir::new()?;
        let mut command = Command::new(env!("CARGO_BIN_EXE_grocery-mcp"));
        command
            .args(["--site", site])
            .arg("--session-file")
            .arg(home.path().join("session.json"))
            .arg("--cookie-file")
            .arg(home.path().join("cookies.json"))
            .env("HOME", home.path())
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for name in ["EMAIL", "PASSWORD", "ZIPCODE"] {
            command.env_remove(format!("{}_{}", site.to_uppercase(), name));
        }

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or("No stdin")?;
        let stdout = BufReader::new(child.stdout.take().ok_or("No stdout")?);

        Ok(Self {
            child,
            stdin,
            stdout,
            _home: home,
        })
    }

    async fn send_line(&mut self, line: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<JsonRpcResponse, Box<dyn std::error::Error>> {
        let mut line = String::new();
        let read = timeout(Duration::from_secs(5), self.stdout.read_line(&mut line)).await??;
        if read == 0 {
            return Err("Server closed connection".into());
        }
        Ok(serde_json::from_str(&line)?)
    }

    async fn send_request(
        &mut self,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, Box<dyn std::error::Error>> {
        let request_json = serde_json::to_string(&request)?;
        self.send_line(&request_json).await?;
        self.read_response().await
    }

    async fn initialize(&mut self) -> JsonRpcResponse {
        let response = self
            .send_request(JsonRpcRequest::new(
                1,
                "initialize",
                Some(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "0.1.0"}
                })),
            ))
            .await
            .unwrap();
        self.send_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await
            .unwrap();
        response
    }

    async fn call_tool(&mut self, id: u64, name: &str, arguments: Value) -> JsonRpcResponse {
        self.send_request(JsonRpcRequest::new(
            id,
            "tools/call",
            Some(json!({"name": name, "arguments": arguments})),
        ))
        .await
        .unwrap()
    }

    async fn close(mut self) {
        let _ = self.child.kill().await;
    }
}

// ============================================================================
// Protocol Compliance Tests
// ============================================================================

#[tokio::test]
async fn test_initialize_handshake() {
    let mut client = McpTestClient::spawn("skroutz").await.unwrap();

    let response = client.initialize().await;

    assert_eq!(response.jsonrpc, "2.0");
    assert_eq!(response.id, Some(1));
    assert!(response.error.is_none(), "Should not have error");
    let result = response.result.unwrap();
    assert_eq!(result["serverInfo"]["name"], "skroutz-mcp");
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert!(result["capabilities"]["tools"].is_object());

    client.close().await;
}

#[tokio::test]
async fn test_tools_list() {
    let mut client = McpTestClient::spawn("sklavenitis").await.unwrap();
    client.initialize().await;

    let response = client
        .send_request(JsonRpcRequest::new(2, "tools/list", None))
        .await
        .unwrap();

    let tools = response.result.unwrap()["tools"].as_array().cloned().unwrap();
    assert_eq!(tools.len(), 10);
    for tool in &tools {
        let name = tool["name"].as_str().unwrap();
        assert!(name.starts_with("sklavenitis_"), "unprefixed tool {}", name);
        assert!(tool["description"].is_string());
        assert_eq!(tool["inputSchema"]["type"], "object");
    }

    client.close().await;
}

#[tokio::test]
async fn test_unknown_language_is_rejected() {
    let home = TempDir::new().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_grocery-mcp"))
        .args(["--site", "efresh", "--language", "../admin"])
        .env("HOME", home.path())
        .stdin(Stdio::null())
        .output()
        .await
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid value"), "stderr: {}", stderr);
}

#[tokio::test]
async fn test_invalid_json() {
    let mut client = McpTestClient::spawn("efresh").await.unwrap();

    client.send_line("{not json").await.unwrap();
    let response = client.read_response().await.unwrap();

    assert_eq!(response.error.unwrap().code, -32700);

    client.close().await;
}

#[tokio::test]
async fn test_unknown_method() {
    let mut client = McpTestClient::spawn("skroutz").await.unwrap();
    client.initialize().await;

    let response = client
        .send_request(JsonRpcRequest::new(3, "unknown/method", None))
        .await
        .unwrap();

    assert_eq!(response.error.unwrap().code, -32601);

    client.close().await;
}

// ============================================================================
// Tool Execution Tests
// ============================================================================

#[tokio::test]
async fn test_session_status_without_login() {
    let mut client = McpTestClient::spawn("skroutz").await.unwrap();
    client.initialize().await;

    let response = client.call_tool(4, "skroutz_session_status", json!({})).await;

    let result = response.result.unwrap();
    assert_eq!(result["isError"], false);
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("Not logged in"));

    client.close().await;
}

#[tokio::test]
async fn test_cart_requires_login() {
    let mut client = McpTestClient::spawn("skroutz").await.unwrap();
    client.initialize().await;

    let response = client.call_tool(5, "skroutz_get_cart", json!({})).await;

    assert!(response.error.is_none());
    assert_eq!(response.result.unwrap()["isError"], true);

    client.close().await;
}

#[tokio::test]
async fn test_shutdown_exits() {
    let mut client = McpTestClient::spawn("skroutz").await.unwrap();
    client.initialize().await;

    let response = client
        .send_request(JsonRpcRequest::new(6, "shutdown", None))
        .await
        .unwrap();
    assert!(response.error.is_none());

    let status = timeout(Duration::from_secs(5), client.child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}
