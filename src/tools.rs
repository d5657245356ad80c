//! Tool definitions and registry for the MCP server.
//!
//! Every tool name is prefixed with the site slug (`sklavenitis_get_cart`,
//! `skroutz_search_products`, ...). Failures caused by the site or the
//! session come back as tool results with `isError` set; malformed calls are
//! JSON-RPC errors.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::SiteKind;
use crate::error::{Error, Result};
use crate::models::{AddToCartResult, Cart, Order, Product, SessionStatus};
use crate::protocol::{ToolCallResult, ToolDefinition};
use crate::sites::Storefront;

/// Default number of search results shown.
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Tool trait for implementing MCP tools.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult>;
}

/// Context passed to tools during execution.
///
/// The storefront sits behind an async mutex: one site operation runs at a
/// time and holds the lock across its network calls.
pub struct ToolContext {
    site: SiteKind,
    storefront: Mutex<Storefront>,
}

impl ToolContext {
    /// Wrap a storefront.
    pub fn new(storefront: Storefront) -> Self {
        Self {
            site: storefront.site(),
            storefront: Mutex::new(storefront),
        }
    }

    /// Site served.
    pub fn site(&self) -> SiteKind {
        self.site
    }

    /// Exclusive access to the storefront.
    pub async fn storefront(&self) -> MutexGuard<'_, Storefront> {
        self.storefront.lock().await
    }
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    context: Arc<ToolContext>,
}

impl ToolRegistry {
    /// Registry with the grocery tools for the context's site.
    pub fn new(context: Arc<ToolContext>) -> Self {
        let site = context.site();
        let mut registry = Self {
            tools: HashMap::new(),
            context,
        };

        registry.register(Arc::new(LoginTool { site }));
        registry.register(Arc::new(LogoutTool { site }));
        registry.register(Arc::new(SessionStatusTool { site }));
        registry.register(Arc::new(SearchProductsTool { site }));
        registry.register(Arc::new(AddToCartTool { site }));
        registry.register(Arc::new(RemoveFromCartTool { site }));
        registry.register(Arc::new(UpdateCartQuantityTool { site }));
        registry.register(Arc::new(GetCartTool { site }));
        registry.register(Arc::new(GetOrdersTool { site }));
        registry.register(Arc::new(GetOrderDetailsTool { site }));

        registry
    }

    /// Shared tool context.
    pub fn context(&self) -> &Arc<ToolContext> {
        &self.context
    }

    /// Get tool definitions, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<_> = self.tools.values().map(|t| t.definition()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Execute a tool by name.
    pub async fn execute(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallResult> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        match tool.execute(arguments, &self.context).await {
            Err(e) if e.is_site_failure() => {
                tracing::warn!(tool = name, error = %e, "tool failed");
                Ok(ToolCallResult::error(e.to_string()))
            }
            other => other,
        }
    }

    /// Register a custom tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name.clone();
        self.tools.insert(name, tool);
    }
}

fn parse_args<T: DeserializeOwned>(arguments: serde_json::Value) -> Result<T> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments).map_err(|e| Error::InvalidParams(e.to_string()))
}

// Product and order ids are numeric on some sites; accept either form.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

fn tool_name(site: SiteKind, name: &str) -> String {
    format!("{}_{}", site.slug(), name)
}

fn euros(amount: Option<f64>) -> String {
    amount.map_or_else(|| "n/a".to_string(), |a| format!("{:.2} €", a))
}

fn quantity(q: f64) -> String {
    if q.fract() == 0.0 {
        format!("{}", q as i64)
    } else {
        format!("{:.3}", q)
    }
}

// ============================================================================
// Formatting
// ============================================================================

fn format_status(site: SiteKind, status: &SessionStatus) -> String {
    let mut out = format!("# {} Session\n\n", site);
    if status.authenticated {
        let email = if status.email.is_empty() {
            "(unknown)"
        } else {
            status.email.as_str()
        };
        let _ = writeln!(out, "🟢 Logged in as {}", email);
    } else {
        let _ = writeln!(out, "⚪ Not logged in");
    }
    let _ = writeln!(out, "\n- **Cookies**: {}", status.cookie_count);
    if let Some(zone) = &status.zone {
        let _ = writeln!(out, "- **Zone**: {}", zone);
    }
    let _ = writeln!(
        out,
        "- **Credentials configured**: {}",
        if status.credentials_configured { "yes" } else { "no" }
    );
    out
}

fn format_products(site: SiteKind, query: &str, products: &[Product], limit: usize) -> String {
    if products.is_empty() {
        return format!("No {} products found for \"{}\".", site, query);
    }
    let mut out = format!(
        "# {} results for \"{}\"\n\nShowing {} of {}.\n\n",
        site,
        query,
        products.len().min(limit),
        products.len()
    );
    for product in products.iter().take(limit) {
        let _ = write!(out, "- **{}** (id `{}`): {}", product.name, product.id, euros(product.price));
        if let Some(old) = product.original_price.filter(|old| Some(*old) != product.price) {
            let _ = write!(out, " ~~{}~~", euros(Some(old)));
        }
        if let Some(maker) = &product.maker {
            let _ = write!(out, " · {}", maker);
        }
        if !product.available {
            out.push_str(" · unavailable");
        }
        out.push('\n');
    }
    out
}

fn format_cart(site: SiteKind, cart: &Cart) -> String {
    if cart.is_empty() {
        return format!("Your {} cart is empty.", site);
    }
    let mut out = format!("# {} Cart\n\n", site);
    for item in &cart.items {
        let _ = writeln!(
            out,
            "- **{}** (id `{}`) × {}: {}",
            item.name,
            item.product_id,
            quantity(item.quantity),
            euros(item.subtotal)
        );
    }
    let _ = writeln!(out, "\n**Items**: {}", quantity(cart.item_count));
    let total = cart.total_text.clone().unwrap_or_else(|| euros(cart.total));
    let _ = writeln!(out, "**Total**: {}", total);
    if let Some(slot) = &cart.delivery_slot {
        let _ = writeln!(out, "**Delivery**: {}", slot);
    }
    out
}

fn format_order_line(out: &mut String, order: &Order) {
    let placed = order
        .created_at
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unknown date".into());
    let _ = writeln!(
        out,
        "- **#{}** (id `{}`) · {} · {} · {}",
        order.number,
        order.id,
        order.status,
        placed,
        euros(order.total)
    );
}

fn format_orders(site: SiteKind, orders: &[Order], include_history: bool) -> String {
    if orders.is_empty() {
        return if include_history {
            format!("No {} orders found.", site)
        } else {
            format!("No active {} orders.", site)
        };
    }
    let mut out = format!("# {} Orders\n\n", site);
    for order in orders {
        format_order_line(&mut out, order);
        for item in &order.items {
            let _ = writeln!(out, "  - {} × {}", item.name, quantity(item.quantity));
        }
    }
    out
}

fn format_order(order: &Order) -> String {
    let mut out = format!("# Order #{}\n\n", order.number);
    format_order_line(&mut out, order);
    if let Some(address) = &order.delivery_address {
        let _ = writeln!(out, "\n**Delivery address**: {}", address);
    }
    if let Some(date) = order.delivery_date {
        let _ = writeln!(out, "**Delivery date**: {}", date.format("%Y-%m-%d %H:%M"));
    }
    if !order.items.is_empty() {
        out.push_str("\n## Items\n\n");
        for item in &order.items {
            let _ = writeln!(
                out,
                "- {} × {}: {}",
                item.name,
                quantity(item.quantity),
                euros(item.subtotal.or(item.price))
            );
        }
    }
    out
}

fn format_added(site: SiteKind, result: &AddToCartResult) -> String {
    let mut out = format!(
        "Added product `{}` to your {} cart (now × {}).",
        result.product_id,
        site,
        quantity(result.cart_quantity)
    );
    if let Some(slot) = &result.selected_slot {
        let _ = write!(out, "\nDelivery slot selected: {}", slot.label);
    }
    let _ = write!(
        out,
        "\nCart total: {}",
        result
            .cart
            .total_text
            .clone()
            .unwrap_or_else(|| euros(result.cart.total))
    );
    out
}

// ============================================================================
// Session tools
// ============================================================================

/// Log in with explicit or configured credentials.
pub struct LoginTool {
    site: SiteKind,
}

#[derive(Debug, Deserialize)]
struct LoginArgs {
    email: Option<String>,
    password: Option<String>,
}

#[async_trait::async_trait]
impl Tool for LoginTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "login"),
            description: format!(
                "Log in to {}. Uses {} and {} when email/password are omitted. The session is saved and reused.",
                self.site,
                self.site.env_var("EMAIL"),
                self.site.env_var("PASSWORD")
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "email": { "type": "string", "description": "Account email" },
                    "password": { "type": "string", "description": "Account password" }
                }
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: LoginArgs = parse_args(arguments)?;
        let status = context
            .storefront()
            .await
            .login(args.email, args.password)
            .await?;
        Ok(ToolCallResult::text(format!(
            "Logged in to {} as {}.",
            self.site, status.email
        )))
    }
}

/// Log out and delete the saved session.
pub struct LogoutTool {
    site: SiteKind,
}

#[async_trait::async_trait]
impl Tool for LogoutTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "logout"),
            description: format!("Log out of {} and delete the saved session.", self.site),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        context.storefront().await.logout().await?;
        Ok(ToolCallResult::text(format!("Logged out of {}.", self.site)))
    }
}

/// Report the session state without touching the network.
pub struct SessionStatusTool {
    site: SiteKind,
}

#[async_trait::async_trait]
impl Tool for SessionStatusTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "session_status"),
            description: format!("Show whether a {} session is active.", self.site),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let status = context.storefront().await.status();
        Ok(ToolCallResult::text(format_status(self.site, &status)))
    }
}

// ============================================================================
// Catalog and cart tools
// ============================================================================

/// Search the catalog.
pub struct SearchProductsTool {
    site: SiteKind,
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    limit: Option<usize>,
}

#[async_trait::async_trait]
impl Tool for SearchProductsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "search_products"),
            description: format!("Search {} products by name.", self.site),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search terms" },
                    "limit": {
                        "type": "integer",
                        "minimum": 1,
                        "description": format!("Maximum results to show (default {})", DEFAULT_SEARCH_LIMIT)
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: SearchArgs = parse_args(arguments)?;
        let limit = args.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).max(1);
        let products = context.storefront().await.search(&args.query).await?;
        Ok(ToolCallResult::text(format_products(
            self.site,
            args.query.trim(),
            &products,
            limit,
        )))
    }
}

fn default_quantity() -> u32 {
    1
}

/// Add a product to the cart.
pub struct AddToCartTool {
    site: SiteKind,
}

#[derive(Debug, Deserialize)]
struct AddToCartArgs {
    #[serde(deserialize_with = "string_or_number")]
    product_id: String,
    #[serde(default = "default_quantity")]
    quantity: u32,
}

#[async_trait::async_trait]
impl Tool for AddToCartTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "add_to_cart"),
            description: format!(
                "Add a product to the {} cart. The cart is re-read to confirm the product is there.",
                self.site
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_id": { "type": "string", "description": "Product id from search results" },
                    "quantity": { "type": "integer", "minimum": 1, "default": 1 }
                },
                "required": ["product_id"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: AddToCartArgs = parse_args(arguments)?;
        let result = context
            .storefront()
            .await
            .add_to_cart(&args.product_id, args.quantity)
            .await?;
        Ok(ToolCallResult::text(format_added(self.site, &result)))
    }
}

/// Remove a product from the cart.
pub struct RemoveFromCartTool {
    site: SiteKind,
}

#[derive(Debug, Deserialize)]
struct ProductArgs {
    #[serde(deserialize_with = "string_or_number")]
    product_id: String,
}

#[async_trait::async_trait]
impl Tool for RemoveFromCartTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "remove_from_cart"),
            description: format!("Remove a product from the {} cart.", self.site),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_id": { "type": "string", "description": "Product id as shown in the cart" }
                },
                "required": ["product_id"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: ProductArgs = parse_args(arguments)?;
        let cart = context
            .storefront()
            .await
            .remove_from_cart(&args.product_id)
            .await?;
        Ok(ToolCallResult::text(format!(
            "Removed product `{}`.\n\n{}",
            args.product_id,
            format_cart(self.site, &cart)
        )))
    }
}

/// Change a cart line's quantity.
pub struct UpdateCartQuantityTool {
    site: SiteKind,
}

#[derive(Debug, Deserialize)]
struct UpdateQuantityArgs {
    #[serde(deserialize_with = "string_or_number")]
    product_id: String,
    quantity: u32,
}

#[async_trait::async_trait]
impl Tool for UpdateCartQuantityTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "update_cart_quantity"),
            description: format!("Set the quantity of a product already in the {} cart.", self.site),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "product_id": { "type": "string", "description": "Product id as shown in the cart" },
                    "quantity": { "type": "integer", "minimum": 1 }
                },
                "required": ["product_id", "quantity"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: UpdateQuantityArgs = parse_args(arguments)?;
        let cart = context
            .storefront()
            .await
            .update_cart_item(&args.product_id, args.quantity)
            .await?;
        Ok(ToolCallResult::text(format_cart(self.site, &cart)))
    }
}

/// Show the cart.
pub struct GetCartTool {
    site: SiteKind,
}

#[async_trait::async_trait]
impl Tool for GetCartTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "get_cart"),
            description: format!("Show the {} shopping cart.", self.site),
            input_schema: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let cart = context.storefront().await.get_cart().await?;
        Ok(ToolCallResult::text(format_cart(self.site, &cart)))
    }
}

// ============================================================================
// Order tools
// ============================================================================

/// List orders.
pub struct GetOrdersTool {
    site: SiteKind,
}

#[derive(Debug, Deserialize)]
struct OrdersArgs {
    #[serde(default = "default_include_history")]
    include_history: bool,
    #[serde(default)]
    include_items: bool,
}

fn default_include_history() -> bool {
    true
}

#[async_trait::async_trait]
impl Tool for GetOrdersTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "get_orders"),
            description: format!("List {} orders.", self.site),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "include_history": {
                        "type": "boolean",
                        "default": true,
                        "description": "Include completed and cancelled orders"
                    },
                    "include_items": {
                        "type": "boolean",
                        "default": false,
                        "description": "Fetch the lines of every order (one extra request per order)"
                    }
                }
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: OrdersArgs = parse_args(arguments)?;
        let orders = context
            .storefront()
            .await
            .get_orders(args.include_history, args.include_items)
            .await?;
        Ok(ToolCallResult::text(format_orders(
            self.site,
            &orders,
            args.include_history,
        )))
    }
}

/// Show one order.
pub struct GetOrderDetailsTool {
    site: SiteKind,
}

#[derive(Debug, Deserialize)]
struct OrderArgs {
    #[serde(deserialize_with = "string_or_number")]
    order_id: String,
}

#[async_trait::async_trait]
impl Tool for GetOrderDetailsTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: tool_name(self.site, "get_order_details"),
            description: format!("Show a {} order with its items.", self.site),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "order_id": { "type": "string", "description": "Order id from get_orders" }
                },
                "required": ["order_id"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> Result<ToolCallResult> {
        let args: OrderArgs = parse_args(arguments)?;
        let order = context
            .storefront()
            .await
            .get_order_details(&args.order_id)
            .await?;
        Ok(ToolCallResult::text(format_order(&order)))
    }
}
