//! e-fresh.gr (Laravel JSON API behind a Vue front end).
//!
//! Every API response is an envelope `{status, message, data, is_loggedin}`.
//! The API authenticates with the session cookie plus the `XSRF-TOKEN` cookie
//! echoed back as a header.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::parse::{self, as_bool, as_f64, as_string, field};
use super::{filter_orders, SiteClient};
use crate::config::{Credentials, Language, SiteKind};
use crate::error::{Error, LoginFailure, Result};
use crate::models::{AddOutcome, Cart, CartItem, Order, OrderItem, Product};
use crate::session::{CookieJar, LoginFlow, LoginOutcome, SessionManager};
use crate::transport::{HttpRequest, HttpResponse, HttpSession};

const API_LOGIN_PATH: &str = "/api/account/login";
const ADDRESS_PATH: &str = "/api/address/view";
const SEARCH_PATH: &str = "/api/list";
const CART_PATH: &str = "/api/cart";
const CART_ADD_PATH: &str = "/api/cart/add";
const CART_REMOVE_PATH: &str = "/api/cart/remove";
const ORDERS_PATH: &str = "/api/account/orders";
const ORDER_PATH: &str = "/api/account/order";

const SESSION_COOKIES: &[&str] = &["efresh_session", "remember_web"];
const XSRF_COOKIE: &str = "XSRF-TOKEN";

/// Upper bound on order history pages fetched.
pub const MAX_ORDER_PAGES: u32 = 50;
const DEFAULT_PAGE_SIZE: usize = 10;

fn login_page(language: Language) -> String {
    format!("/{}/account/login", language)
}

fn xsrf_token(jar: &CookieJar) -> Option<String> {
    let raw = jar.get(XSRF_COOKIE)?;
    Some(
        urlencoding::decode(raw)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| raw.clone()),
    )
}

/// Fields the web client sends with every API body.
fn client_fields(language: Language) -> serde_json::Map<String, Value> {
    let mut fields = serde_json::Map::new();
    fields.insert("os".into(), json!("web"));
    fields.insert("lang".into(), json!(language.as_str()));
    fields.insert("screen_width".into(), json!(1920));
    fields.insert("screen_height".into(), json!(1080));
    fields
}

fn api_body(language: Language, extra: Value) -> Value {
    let mut body = client_fields(language);
    if let Value::Object(extra) = extra {
        body.extend(extra);
    }
    Value::Object(body)
}

fn api_request(request: HttpRequest, jar: &CookieJar, csrf_token: Option<&str>) -> HttpRequest {
    let mut request = request
        .ajax()
        .header("Accept", "application/json, text/plain, */*");
    if let Some(token) = xsrf_token(jar) {
        request = request.header("X-XSRF-TOKEN", token);
    }
    if let Some(token) = csrf_token {
        request = request.header("X-CSRF-TOKEN", token);
    }
    request
}

/// E-Fresh JSON API login.
#[derive(Debug, Clone)]
pub struct EfreshLogin {
    language: Language,
}

impl EfreshLogin {
    /// Login flow using the `language` interface.
    pub fn new(language: Language) -> Self {
        Self { language }
    }
}

#[async_trait]
impl LoginFlow for EfreshLogin {
    fn site(&self) -> SiteKind {
        SiteKind::Efresh
    }

    fn session_cookies(&self) -> &'static [&'static str] {
        SESSION_COOKIES
    }

    async fn login(
        &self,
        http: &HttpSession,
        jar: &mut CookieJar,
        credentials: &Credentials,
    ) -> Result<LoginOutcome> {
        let page_path = login_page(self.language);
        let page = http.send(jar, HttpRequest::get(page_path.as_str())).await?;
        if page.status == 403 || parse::is_bot_challenge(&page.body) {
            return Ok(LoginOutcome::Failed(LoginFailure::BotChallenge));
        }
        let page = page.error_for_status("login page")?;
        let csrf_token = parse::extract_csrf_token(&page.body);
        if csrf_token.is_none() && xsrf_token(jar).is_none() {
            return Ok(LoginOutcome::Failed(LoginFailure::MissingToken));
        }

        let body = api_body(
            self.language,
            json!({
                "email": credentials.email,
                "password": credentials.password,
                "remember": true,
            }),
        );
        let request = api_request(HttpRequest::post(API_LOGIN_PATH), jar, csrf_token.as_deref())
            .header("Referer", http.url(&page_path)?)
            .header("Origin", http.base_url())
            .json(body);
        let response = http.send(jar, request).await?;

        match response.status {
            419 => return Ok(LoginOutcome::Failed(LoginFailure::MissingToken)),
            403 => return Ok(LoginOutcome::Failed(LoginFailure::BotChallenge)),
            401 | 422 => return Ok(LoginOutcome::Failed(failure_from_body(&response))),
            _ => {}
        }
        let response = response.error_for_status("login")?;
        let value: Value = response.json_body()?;
        if value.get("status").and_then(as_bool) != Some(true) {
            tracing::debug!(message = ?value.get("message"), "login rejected");
            return Ok(LoginOutcome::Failed(failure_from_body(&response)));
        }

        let verify_request = api_request(HttpRequest::get(ADDRESS_PATH), jar, None);
        let verify = http.send(jar, verify_request).await?;
        let verified = verify.is_success()
            && verify
                .json_body::<Value>()
                .ok()
                .and_then(|v| v.get("status").and_then(as_bool))
                == Some(true);
        if !verified {
            return Ok(LoginOutcome::Failed(LoginFailure::Unverified));
        }
        Ok(LoginOutcome::Authenticated { csrf_token })
    }

    fn logout_request(&self) -> Option<HttpRequest> {
        Some(HttpRequest::get(format!("/{}/account/logout", self.language)))
    }
}

fn failure_from_body(response: &HttpResponse) -> LoginFailure {
    if response.body.to_lowercase().contains("captcha") {
        LoginFailure::BotChallenge
    } else {
        LoginFailure::InvalidCredentials
    }
}

/// Decode an API envelope. With `requires_login`, `is_loggedin: false` and
/// login redirects mean the session expired.
pub fn envelope(
    response: &HttpResponse,
    requires_login: bool,
    login_path: &str,
    context: &str,
) -> Result<Value> {
    if requires_login {
        parse::check_session(response, login_path)?;
    }
    if !response.is_success() {
        return Err(Error::HttpStatus {
            status: response.status,
            context: context.to_string(),
        });
    }
    let value: Value = response.json_body()?;
    if requires_login && value.get("is_loggedin").and_then(as_bool) == Some(false) {
        return Err(Error::SessionExpired);
    }
    if value.get("status").and_then(as_bool) == Some(false) {
        let message = field(&value, &["message", "error"])
            .and_then(as_string)
            .unwrap_or_else(|| format!("{} was refused", context));
        return Err(Error::OperationFailed(message));
    }
    Ok(value)
}

fn product_from(item: &Value) -> Option<Product> {
    let id = field(item, &["kodikos", "id"]).and_then(as_string)?;
    let name = field(item, &["title", "name"]).and_then(as_string)?;
    let attrs = item.get("attrs");
    let mut product = Product::new(id, name);
    product.price = field(item, &["price"]).and_then(as_f64);
    product.original_price = field(item, &["price_old"])
        .and_then(as_f64)
        .filter(|old| *old > 0.0);
    product.maker = attrs
        .and_then(|a| a.get("developer_id"))
        .and_then(|d| d.get("title"))
        .and_then(as_string);
    product.unit = attrs
        .and_then(|a| a.get("pkg_unit"))
        .and_then(|u| u.get("title"))
        .and_then(as_string);
    product.ean = field(item, &["barcode"]).and_then(as_string);
    product.image_url = item
        .get("image")
        .filter(|img| img.get("has_image").and_then(as_bool) != Some(false))
        .and_then(|img| img.get("url"))
        .and_then(as_string);
    product.url = field(item, &["url", "slug"]).and_then(as_string);
    product.available = field(item, &["in_stock"]).and_then(as_bool).unwrap_or(true)
        && field(item, &["is_saleable"]).and_then(as_bool).unwrap_or(true);
    Some(product)
}

/// `data.<key>` as a list, accepting a paginator (`{data: [...]}`) or a bare
/// array.
fn envelope_list<'a>(value: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    let section = value.get("data").and_then(|d| d.get(key));
    section
        .and_then(|s| s.get("data"))
        .or(section)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::UnrecognizedResponse(format!("response has no data.{} list", key)))
}

/// Products in a `/api/list` envelope.
pub fn parse_search(value: &Value) -> Result<Vec<Product>> {
    Ok(envelope_list(value, "products")?
        .iter()
        .filter_map(product_from)
        .collect())
}

/// Cart in a `/api/cart` envelope.
pub fn parse_cart(value: &Value) -> Result<Cart> {
    let cart = value
        .get("data")
        .and_then(|d| d.get("cart"))
        .filter(|c| c.is_object())
        .ok_or_else(|| Error::UnrecognizedResponse("cart response has no data.cart".into()))?;

    let items: Vec<CartItem> = cart
        .get("items")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|line| {
            let product = line.get("item");
            let line_id = field(line, &["id"]).and_then(as_string);
            let product_id = product
                .and_then(|p| field(p, &["kodikos", "id"]))
                .and_then(as_string)
                .or_else(|| field(line, &["product_id"]).and_then(as_string))
                .or_else(|| line_id.clone())?;
            let name = field(line, &["name"])
                .or_else(|| product.and_then(|p| p.get("title")))
                .and_then(as_string)
                .unwrap_or_else(|| format!("Product {}", product_id));
            Some(CartItem {
                product_id,
                name,
                quantity: field(line, &["qty", "quantity"]).and_then(as_f64).unwrap_or(1.0),
                unit_price: field(line, &["price"]).and_then(as_f64),
                subtotal: field(line, &["total", "subtotal"]).and_then(as_f64),
                line_id,
            })
        })
        .collect();

    let total = field(cart, &["total"]).and_then(as_f64);
    Ok(Cart {
        item_count: field(cart, &["total_qty"])
            .and_then(as_f64)
            .unwrap_or_else(|| items.iter().fold(0.0, |sum, i| sum + i.quantity)),
        items,
        total,
        total_text: total.map(|t| format!("{:.2} €", t)),
        delivery_slot: field(cart, &["delivery_slot", "timeslot"]).and_then(as_string),
    })
}

fn order_from(order: &Value) -> Option<Order> {
    let id = field(order, &["order_id", "id"]).and_then(as_string)?;
    let items = field(order, &["order_items", "items"])
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|item| OrderItem {
            name: field(item, &["title", "product_name", "name"])
                .and_then(as_string)
                .unwrap_or_else(|| "Unknown".into()),
            quantity: field(item, &["quantity", "qty"]).and_then(as_f64).unwrap_or(1.0),
            price: field(item, &["price"]).and_then(as_f64),
            subtotal: field(item, &["subtotal", "total"]).and_then(as_f64),
        })
        .collect();
    Some(Order {
        number: field(order, &["order_number", "order_id", "id"])
            .and_then(as_string)
            .unwrap_or_else(|| id.clone()),
        id,
        status: field(order, &["status"])
            .and_then(as_string)
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".into()),
        created_at: field(order, &["created_at"])
            .and_then(Value::as_str)
            .and_then(parse::parse_datetime),
        total: field(order, &["total_amount", "total"]).and_then(as_f64),
        items,
        delivery_address: field(order, &["delivery_address"]).and_then(as_string),
        delivery_date: field(order, &["delivery_date"])
            .and_then(Value::as_str)
            .and_then(parse::parse_datetime),
    })
}

/// One page of `/api/account/orders`, with the page size the site reports.
pub fn parse_orders_page(value: &Value) -> Result<(Vec<Order>, usize)> {
    let per_page = value
        .get("data")
        .and_then(|d| d.get("orders"))
        .and_then(|o| o.get("per_page"))
        .and_then(as_f64)
        .map(|n| n as usize)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let orders = envelope_list(value, "orders")?
        .iter()
        .filter_map(order_from)
        .collect();
    Ok((orders, per_page))
}

/// E-Fresh catalog and cart.
#[derive(Debug, Clone)]
pub struct EfreshClient {
    language: Language,
}

impl EfreshClient {
    /// Client using the `language` interface.
    pub fn new(language: Language) -> Self {
        Self { language }
    }

    async fn call(
        &self,
        session: &mut SessionManager,
        request: HttpRequest,
        requires_login: bool,
        context: &str,
    ) -> Result<Value> {
        let request = api_request(
            request,
            &session.record().cookies,
            session.record().csrf_token.as_deref(),
        );
        let response = session.send(request).await?;
        envelope(&response, requires_login, &login_page(self.language), context)
    }

    async fn set_quantity(
        &self,
        session: &mut SessionManager,
        product_id: &str,
        quantity: u32,
    ) -> Result<Option<String>> {
        let body = api_body(
            self.language,
            json!({ "product_id": product_id, "quantity": quantity }),
        );
        let value = self
            .call(session, HttpRequest::post(CART_ADD_PATH).json(body), true, "cart update")
            .await?;
        Ok(field(&value, &["message"]).and_then(as_string))
    }
}

#[async_trait]
impl SiteClient for EfreshClient {
    fn kind(&self) -> SiteKind {
        SiteKind::Efresh
    }

    async fn search(&self, session: &mut SessionManager, query: &str) -> Result<Vec<Product>> {
        let request = HttpRequest::get(SEARCH_PATH)
            .query("q", query)
            .query("page", "1");
        let value = self.call(session, request, false, "search").await?;
        let products = parse_search(&value)?;
        tracing::debug!(query, results = products.len(), "search finished");
        Ok(products)
    }

    async fn add_to_cart(
        &self,
        session: &mut SessionManager,
        product_id: &str,
        quantity: u32,
    ) -> Result<AddOutcome> {
        let message = self.set_quantity(session, product_id, quantity).await?;
        Ok(AddOutcome {
            selected_slot: None,
            message,
        })
    }

    async fn remove_from_cart(&self, session: &mut SessionManager, product_id: &str) -> Result<()> {
        let body = api_body(self.language, json!({ "product_id": product_id }));
        self.call(session, HttpRequest::post(CART_REMOVE_PATH).json(body), true, "cart removal")
            .await?;
        Ok(())
    }

    async fn update_cart_item(
        &self,
        session: &mut SessionManager,
        product_id: &str,
        quantity: u32,
    ) -> Result<()> {
        self.set_quantity(session, product_id, quantity).await?;
        Ok(())
    }

    async fn get_cart(&self, session: &mut SessionManager) -> Result<Cart> {
        let value = self
            .call(session, HttpRequest::get(CART_PATH), true, "cart")
            .await?;
        parse_cart(&value)
    }

    async fn get_orders(&self, session: &mut SessionManager, include_history: bool) -> Result<Vec<Order>> {
        let mut orders = Vec::new();
        for page in 1..=MAX_ORDER_PAGES {
            let body = api_body(self.language, json!({ "page": page }));
            let value = self
                .call(session, HttpRequest::post(ORDERS_PATH).json(body), true, "order history")
                .await?;
            let (batch, per_page) = parse_orders_page(&value)?;
            let fetched = batch.len();
            orders.extend(batch);
            tracing::debug!(page, fetched, "order page");
            if fetched < per_page {
                break;
            }
        }
        Ok(filter_orders(orders, include_history))
    }

    async fn get_order_details(&self, session: &mut SessionManager, order_id: &str) -> Result<Order> {
        let body = api_body(self.language, json!({ "id": order_id }));
        let value = self
            .call(session, HttpRequest::post(ORDER_PATH).json(body), true, "order details")
            .await?;
        value
            .get("data")
            .and_then(|d| d.get("order"))
            .and_then(order_from)
            .ok_or_else(|| Error::OperationFailed(format!("order {} not found", order_id)))
    }
}
