//! MCP request handling against a scripted Skroutz.

mod common;

use std::sync::Arc;

use common::{config, session_path, storefront, write_session, ScriptedTransport};
use grocery_mcp::config::SiteKind;
use grocery_mcp::server::{McpServer, ServerState};
use grocery_mcp::transport::HttpResponse;
use serde_json::{json, Value};
use tempfile::TempDir;

fn server(dir: &TempDir, transport: &Arc<ScriptedTransport>) -> McpServer {
    McpServer::new(storefront(&config(SiteKind::Skroutz, dir), transport))
}

async fn call(server: &McpServer, id: i64, method: &str, params: Value) -> Value {
    let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    let response = server
        .handle_message(&request.to_string())
        .await
        .expect("requests get a response");
    serde_json::to_value(response).unwrap()
}

async fn initialize(server: &McpServer) -> Value {
    call(
        server,
        1,
        "initialize",
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"roots": {"listChanged": true}},
            "clientInfo": {"name": "test-client", "version": "1.0.0"}
        }),
    )
    .await
}

async fn call_tool(server: &McpServer, name: &str, arguments: Value) -> Value {
    call(server, 7, "tools/call", json!({"name": name, "arguments": arguments})).await
}

fn text_of(response: &Value) -> &str {
    response["result"]["content"][0]["text"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn initialize_advertises_site_and_capabilities() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, &ScriptedTransport::new());
    assert_eq!(server.state().await, ServerState::Uninitialized);

    let response = initialize(&server).await;

    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "skroutz-mcp");
    assert!(result["capabilities"]["tools"].is_object());
    assert!(result["capabilities"]["resources"].is_object());
    assert_eq!(server.state().await, ServerState::Ready);
    let capabilities = server.client_capabilities().await.unwrap();
    assert!(capabilities.roots.is_some());
}

#[tokio::test]
async fn requests_before_initialize_are_rejected() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, &ScriptedTransport::new());

    let response = call(&server, 2, "tools/list", json!({})).await;

    assert_eq!(response["error"]["code"], -32603);
    assert!(response.get("result").is_none());
}

#[tokio::test]
async fn tools_are_prefixed_with_site() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, &ScriptedTransport::new());
    initialize(&server).await;

    let response = call(&server, 2, "tools/list", json!({})).await;

    let names: Vec<&str> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(
        names,
        [
            "skroutz_add_to_cart",
            "skroutz_get_cart",
            "skroutz_get_order_details",
            "skroutz_get_orders",
            "skroutz_login",
            "skroutz_logout",
            "skroutz_remove_from_cart",
            "skroutz_search_products",
            "skroutz_session_status",
            "skroutz_update_cart_quantity",
        ]
    );
    let search = &response["result"]["tools"][7];
    assert_eq!(search["inputSchema"]["required"], json!(["query"]));
}

#[tokio::test]
async fn protocol_errors_use_json_rpc_codes() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let server = server(&dir, &transport);
    initialize(&server).await;

    let unknown = call_tool(&server, "sklavenitis_get_cart", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);

    let zero = call_tool(&server, "skroutz_add_to_cart", json!({"product_id": "1", "quantity": 0})).await;
    assert_eq!(zero["error"]["code"], -32602);

    let missing = call_tool(&server, "skroutz_search_products", json!({})).await;
    assert_eq!(missing["error"]["code"], -32602);

    let method = call(&server, 3, "prompts/list", json!({})).await;
    assert_eq!(method["error"]["code"], -32601);

    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn site_failures_are_tool_errors() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, &ScriptedTransport::new());
    initialize(&server).await;

    let response = call_tool(&server, "skroutz_get_cart", json!({})).await;

    assert!(response.get("error").is_none());
    assert_eq!(response["result"]["isError"], true);
    assert!(text_of(&response).contains("SKROUTZ_EMAIL"));
}

#[tokio::test]
async fn network_failures_are_tool_errors() {
    let dir = TempDir::new().unwrap();
    write_session(&session_path(&dir), ("_helmet_couch", "cached"));
    let transport = ScriptedTransport::new();
    let server = server(&dir, &transport);
    initialize(&server).await;

    let response = call_tool(&server, "skroutz_get_cart", json!({})).await;

    assert!(response.get("error").is_none());
    assert_eq!(response["result"]["isError"], true);
    assert!(text_of(&response).contains("no scripted response"));
    assert_eq!(transport.count("/cart.json"), 1);
}

#[tokio::test]
async fn unrecognized_responses_are_tool_errors() {
    let dir = TempDir::new().unwrap();
    write_session(&session_path(&dir), ("_helmet_couch", "cached"));
    let transport = ScriptedTransport::new();
    transport.get("/cart.json", HttpResponse::new(200, "<html>maintenance</html>"));
    let server = server(&dir, &transport);
    initialize(&server).await;

    let response = call_tool(&server, "skroutz_get_cart", json!({})).await;

    assert!(response.get("error").is_none());
    assert_eq!(response["result"]["isError"], true);
}

#[tokio::test]
async fn session_status_reports_login_state() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, &ScriptedTransport::new());
    initialize(&server).await;

    let response = call_tool(&server, "skroutz_session_status", Value::Null).await;

    assert_eq!(response["result"]["isError"], false);
    let text = text_of(&response);
    assert!(text.contains("# Skroutz Session"));
    assert!(text.contains("Not logged in"));
    assert!(text.contains("**Credentials configured**: no"));
}

#[tokio::test]
async fn resources_follow_authentication() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let anonymous = server(&dir, &transport);
    initialize(&anonymous).await;

    let listed = call(&anonymous, 2, "resources/list", json!({})).await;
    assert_eq!(listed["result"]["resources"], json!([]));
    let read = call(&anonymous, 3, "resources/read", json!({"uri": "skroutz://cart"})).await;
    assert_eq!(read["error"]["code"], -32001);

    write_session(&session_path(&dir), ("_helmet_couch", "cached"));
    transport.get(
        "/cart.json",
        HttpResponse::json(
            200,
            json!({"cart": {"proposals": [{
                "summary": {"total_cost": "6,20 €"},
                "packages": [{"items": [{
                    "id": 555, "sku_id": 31415926, "name": "Καφές φίλτρου 500g",
                    "quantity": 1, "total_cost": 6.2
                }]}]
            }]}}),
        ),
    );
    let logged_in = server(&dir, &transport);
    initialize(&logged_in).await;

    let listed = call(&logged_in, 2, "resources/list", json!({})).await;
    let uris: Vec<&str> = listed["result"]["resources"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["uri"].as_str())
        .collect();
    assert_eq!(uris, ["skroutz://cart", "skroutz://orders"]);

    let read = call(&logged_in, 3, "resources/read", json!({"uri": "skroutz://cart"})).await;
    let contents = &read["result"]["contents"][0];
    assert_eq!(contents["mimeType"], "application/json");
    let cart: Value = serde_json::from_str(contents["text"].as_str().unwrap()).unwrap();
    assert_eq!(cart["items"][0]["product_id"], "31415926");

    let unknown = call(&logged_in, 4, "resources/read", json!({"uri": "skroutz://wishlist"})).await;
    assert_eq!(unknown["error"]["code"], -32602);
}

#[tokio::test]
async fn malformed_input_and_notifications() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, &ScriptedTransport::new());

    let parse_error = server.handle_message("{not json").await.unwrap();
    assert_eq!(parse_error.error.unwrap().code, -32700);

    let notification = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
    assert!(server.handle_message(&notification.to_string()).await.is_none());
}

#[tokio::test]
async fn ping_and_shutdown() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, &ScriptedTransport::new());
    initialize(&server).await;

    let pong = call(&server, 5, "ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));

    call(&server, 6, "shutdown", Value::Null).await;
    assert_eq!(server.state().await, ServerState::ShuttingDown);
}
