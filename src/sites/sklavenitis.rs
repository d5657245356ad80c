//! sklavenitis.gr (ASP.NET storefront).
//!
//! Cart changes go through the "user flow" endpoint. The first post carries
//! the product; when no delivery slot is selected yet the site answers with
//! an HTML slot picker instead of JSON, and a second post selects a slot.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use scraper::Html;
use serde_json::Value;

use super::parse::{self, as_bool, as_f64, as_string, field};
use super::{filter_orders, SiteClient};
use crate::config::{Credentials, SiteKind};
use crate::error::{Error, LoginFailure, Result};
use crate::models::{AddOutcome, Cart, CartItem, DeliverySlot, Order, Product};
use crate::session::{CookieJar, LoginFlow, LoginOutcome, SessionManager};
use crate::transport::{HttpRequest, HttpResponse, HttpSession};

const LOGIN_PATH: &str = "/gr/account/login/";
const ACCOUNT_PATH: &str = "/gr/account/";
const LOGOUT_PATH: &str = "/gr/account/logout/";
const SEARCH_PATH: &str = "/gr/ajax/Atcom.Sites.Yoda.Components.Autocomplete.SearchAutocomplete/";
const USER_FLOW_PATH: &str = "/gr/ajax/Atcom.Sites.Yoda.Components.UserFlow.AddToCartUserFlow.Index/";
const CART_PATH: &str = "/gr/ajax/Atcom.Sites.Yoda.Components.ClientContext.Index/";
const ORDERS_PATH: &str = "/gr/account/orders/";

const SESSION_COOKIES: &[&str] = &[".AspNet.ApplicationCookie", ".ASPXAUTH"];

/// User-flow step shown when the account has no delivery address.
pub const DELIVERY_SETUP_STEP: &str = "AddressSelection";

const SLOT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Sklavenitis login handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct SklavenitisLogin;

#[async_trait]
impl LoginFlow for SklavenitisLogin {
    fn site(&self) -> SiteKind {
        SiteKind::Sklavenitis
    }

    fn session_cookies(&self) -> &'static [&'static str] {
        SESSION_COOKIES
    }

    fn zone_cookie(&self, zone: &str) -> Option<(String, String)> {
        let hub_id: u64 = match zone.trim().parse() {
            Ok(id) => id,
            Err(_) => {
                tracing::warn!(zone, "zone is not a numeric hub id, not setting Zone cookie");
                return None;
            }
        };
        Some((
            "Zone".to_string(),
            format!(r#"{{"ShippingType":1,"HubID":{}}}"#, hub_id),
        ))
    }

    async fn login(
        &self,
        http: &HttpSession,
        jar: &mut CookieJar,
        credentials: &Credentials,
    ) -> Result<LoginOutcome> {
        let page = http.send(jar, HttpRequest::get(LOGIN_PATH)).await?;
        if page.status == 403 || parse::is_bot_challenge(&page.body) {
            return Ok(LoginOutcome::Failed(LoginFailure::BotChallenge));
        }
        let page = page.error_for_status("login page")?;
        let Some(token) = parse::extract_csrf_token(&page.body) else {
            return Ok(LoginOutcome::Failed(LoginFailure::MissingToken));
        };

        let submit = HttpRequest::post(LOGIN_PATH)
            .header("Referer", http.url(LOGIN_PATH)?)
            .form([
                ("__RequestVerificationToken", token.as_str()),
                ("UserName", credentials.email.as_str()),
                ("Password", credentials.password.as_str()),
                ("RememberMe", "true"),
            ]);
        let response = http.send(jar, submit).await?;

        if response.status == 403 || parse::is_bot_challenge(&response.body) {
            return Ok(LoginOutcome::Failed(LoginFailure::BotChallenge));
        }
        if response.is_success() && parse::has_logout_marker(&response.body) {
            return Ok(LoginOutcome::Authenticated {
                csrf_token: parse::extract_csrf_token(&response.body).or(Some(token)),
            });
        }
        if has_validation_errors(&response.body) {
            return Ok(LoginOutcome::Failed(LoginFailure::InvalidCredentials));
        }

        let account = http.send(jar, HttpRequest::get(ACCOUNT_PATH)).await?;
        if account.is_success() && parse::has_logout_marker(&account.body) {
            return Ok(LoginOutcome::Authenticated {
                csrf_token: parse::extract_csrf_token(&account.body).or(Some(token)),
            });
        }
        Ok(LoginOutcome::Failed(LoginFailure::Unverified))
    }

    fn logout_request(&self) -> Option<HttpRequest> {
        Some(HttpRequest::get(LOGOUT_PATH))
    }
}

fn has_validation_errors(html: &str) -> bool {
    html.contains("validation-summary-errors") || html.contains("field-validation-error")
}

/// Sklavenitis catalog and cart.
#[derive(Debug, Default, Clone, Copy)]
pub struct SklavenitisClient;

impl SklavenitisClient {
    async fn post_user_flow(
        &self,
        session: &mut SessionManager,
        fields: Vec<(String, String)>,
        extra_header: (&str, &str),
    ) -> Result<HttpResponse> {
        let request = HttpRequest::post(USER_FLOW_PATH)
            .ajax()
            .header(extra_header.0, extra_header.1)
            .form(fields);
        let response = session.send(request).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        response.error_for_status("cart update")
    }

    async fn set_quantity(
        &self,
        session: &mut SessionManager,
        sku: &str,
        quantity: u32,
    ) -> Result<HttpResponse> {
        self.post_user_flow(session, quantity_fields(sku, quantity), ("X-UserFlow-New", "true"))
            .await
    }

    async fn select_slot(&self, session: &mut SessionManager, slot: &DeliverySlot) -> Result<()> {
        let fields = vec![
            ("TimeSlotDate".to_string(), slot.from.format(SLOT_FORMAT).to_string()),
            ("TimeSlotDateTo".to_string(), slot.to.format(SLOT_FORMAT).to_string()),
            ("RequiresNotification".to_string(), "False".to_string()),
        ];
        let response = self
            .post_user_flow(session, fields, ("X-NoRedirect", "true"))
            .await?;
        if response.is_json() {
            let value: Value = response.json_body()?;
            check_user_flow_json(&value)?;
        } else if requires_delivery_setup_html(&response.body) {
            return Err(delivery_setup_error());
        }
        tracing::info!(slot = %slot.label, "delivery slot selected");
        Ok(())
    }
}

fn quantity_fields(sku: &str, quantity: u32) -> Vec<(String, String)> {
    vec![
        ("Action".to_string(), "Update".to_string()),
        ("CartItems[0][ProductSKU]".to_string(), sku.to_string()),
        ("CartItems[0][Quantity]".to_string(), quantity.to_string()),
    ]
}

fn delivery_setup_error() -> Error {
    Error::DeliverySetupRequired(
        "set a delivery address on sklavenitis.gr (or SKLAVENITIS_ZIPCODE) before adding to the cart"
            .into(),
    )
}

/// Whether a user-flow JSON body asks for the address step.
pub fn requires_delivery_setup_json(value: &Value) -> bool {
    ["Action", "Step", "NextStep"]
        .iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .any(|step| step == DELIVERY_SETUP_STEP)
}

/// Whether a user-flow HTML fragment is the address step.
pub fn requires_delivery_setup_html(html: &str) -> bool {
    html.contains(&format!("data-step=\"{}\"", DELIVERY_SETUP_STEP))
        || html.contains(&format!("data-step='{}'", DELIVERY_SETUP_STEP))
}

fn check_user_flow_json(value: &Value) -> Result<Option<String>> {
    if requires_delivery_setup_json(value) {
        return Err(delivery_setup_error());
    }
    let message = field(value, &["Message", "message", "ErrorMessage"]).and_then(as_string);
    match field(value, &["Success", "success"]).and_then(as_bool) {
        Some(false) => Err(Error::OperationFailed(
            message.unwrap_or_else(|| "the site refused the cart update".into()),
        )),
        _ => Ok(message),
    }
}

/// Delivery slots offered in a user-flow fragment, in page order.
pub fn parse_delivery_slots(html: &str) -> Result<Vec<DeliverySlot>> {
    let document = Html::parse_fragment(html);
    let slots = parse::selector("[data-timeslot-from]")?;
    let mut parsed = Vec::new();

    for element in document.select(&slots) {
        let attrs = element.value();
        let available = attrs.attr("data-available").map_or(true, |a| !a.eq_ignore_ascii_case("false"))
            && !attrs
                .classes()
                .any(|c| matches!(c, "disabled" | "unavailable" | "full"));
        if !available {
            continue;
        }
        let from = attrs.attr("data-timeslot-from").and_then(parse_slot_time);
        let to = attrs.attr("data-timeslot-to").and_then(parse_slot_time);
        let (Some(from), Some(to)) = (from, to) else {
            continue;
        };
        parsed.push(DeliverySlot {
            from,
            to,
            label: parse::text_of(element),
        });
    }

    Ok(parsed)
}

fn parse_slot_time(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text.trim(), SLOT_FORMAT)
        .ok()
        .or_else(|| parse::parse_datetime(text))
}

fn sku_from_url(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    let (_, tail) = trimmed.rsplit_once('-')?;
    (!tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit())).then(|| tail.to_string())
}

/// Parse the autocomplete JSON into products.
pub fn parse_search(value: &Value) -> Result<Vec<Product>> {
    let entries = value
        .as_array()
        .or_else(|| field(value, &["Items", "items", "Products"]).and_then(Value::as_array))
        .ok_or_else(|| Error::UnrecognizedResponse("search response is not a list".into()))?;

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let url = entry.get("url").and_then(Value::as_str)?;
            let sku = sku_from_url(url)?;
            let name = field(entry, &["label", "name"]).and_then(as_string)?;
            let mut product = Product::new(sku, name);
            product.price = field(entry, &["price", "Price"]).and_then(as_f64);
            product.original_price = field(entry, &["oldPrice", "OldPrice"]).and_then(as_f64);
            product.description = field(entry, &["category"]).and_then(as_string);
            product.image_url = field(entry, &["image", "img"]).and_then(as_string);
            product.url = Some(url.to_string());
            Some(product)
        })
        .collect())
}

/// Parse the client-context cart JSON.
pub fn parse_cart(value: &Value) -> Result<Cart> {
    let Some(object) = value.as_object() else {
        return Err(Error::UnrecognizedResponse("cart response is not an object".into()));
    };
    if object.get("IsAuthenticated").and_then(as_bool) == Some(false) {
        return Err(Error::SessionExpired);
    }

    let items: Vec<CartItem> = match object.get("Items") {
        Some(Value::Object(items)) => items
            .iter()
            .map(|(sku, details)| cart_item(sku, details))
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|details| {
                let sku = field(details, &["ProductSKU", "Sku", "SKU"]).and_then(as_string)?;
                Some(cart_item(&sku, details))
            })
            .collect(),
        Some(Value::Null) => Vec::new(),
        _ => {
            return Err(Error::UnrecognizedResponse(
                "cart response has no Items".into(),
            ))
        }
    };

    let item_count = object
        .get("SummaryText")
        .and_then(as_f64)
        .unwrap_or_else(|| items.iter().fold(0.0, |sum, i| sum + i.quantity));
    let total_text = object.get("GrandTotal").and_then(as_string);
    let total = total_text.as_deref().and_then(parse::parse_price);

    Ok(Cart {
        items,
        item_count,
        total,
        total_text,
        delivery_slot: object.get("SlotInfoWithDay").and_then(as_string),
    })
}

fn cart_item(sku: &str, details: &Value) -> CartItem {
    let quantity = field(details, &["CartQuantity", "Quantity"])
        .and_then(as_f64)
        .unwrap_or(0.0);
    let unit_price = field(details, &["Price", "UnitPrice"]).and_then(as_f64);
    CartItem {
        product_id: sku.to_string(),
        name: field(details, &["Name", "Title"])
            .and_then(as_string)
            .unwrap_or_else(|| format!("Product {}", sku)),
        quantity,
        unit_price,
        subtotal: field(details, &["Total", "TotalPrice"])
            .and_then(as_f64)
            .or(unit_price.map(|p| p * quantity)),
        line_id: None,
    }
}

#[async_trait]
impl SiteClient for SklavenitisClient {
    fn kind(&self) -> SiteKind {
        SiteKind::Sklavenitis
    }

    async fn search(&self, session: &mut SessionManager, query: &str) -> Result<Vec<Product>> {
        let request = HttpRequest::get(SEARCH_PATH)
            .query("term", query)
            .ajax()
            .header("Accept", "application/json");
        let response = session.send(request).await?.error_for_status("search")?;
        let value: Value = response.json_body()?;
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
        let response = self.set_quantity(session, product_id, quantity).await?;

        if response.is_json() {
            let value: Value = response.json_body()?;
            let message = check_user_flow_json(&value)?;
            return Ok(AddOutcome {
                selected_slot: None,
                message,
            });
        }

        if requires_delivery_setup_html(&response.body) {
            return Err(delivery_setup_error());
        }
        if !response.body.contains("data-timeslot-from") {
            return Err(Error::UnrecognizedResponse(
                "cart update returned neither JSON nor a slot picker".into(),
            ));
        }
        let Some(slot) = parse_delivery_slots(&response.body)?.into_iter().next() else {
            return Err(Error::OperationFailed("no delivery slot is available".into()));
        };
        self.select_slot(session, &slot).await?;
        Ok(AddOutcome {
            selected_slot: Some(slot),
            message: None,
        })
    }

    async fn remove_from_cart(&self, session: &mut SessionManager, product_id: &str) -> Result<()> {
        let response = self.set_quantity(session, product_id, 0).await?;
        if response.is_json() {
            check_user_flow_json(&response.json_body()?)?;
        }
        Ok(())
    }

    async fn update_cart_item(
        &self,
        session: &mut SessionManager,
        product_id: &str,
        quantity: u32,
    ) -> Result<()> {
        let response = self.set_quantity(session, product_id, quantity).await?;
        if response.is_json() {
            check_user_flow_json(&response.json_body()?)?;
        } else if requires_delivery_setup_html(&response.body) {
            return Err(delivery_setup_error());
        }
        Ok(())
    }

    async fn get_cart(&self, session: &mut SessionManager) -> Result<Cart> {
        let request = HttpRequest::post(CART_PATH)
            .query("type", "Cart")
            .ajax()
            .header("Accept", "application/json");
        let response = session.send(request).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        let response = response.error_for_status("cart")?;
        parse_cart(&response.json_body()?)
    }

    async fn get_orders(&self, session: &mut SessionManager, include_history: bool) -> Result<Vec<Order>> {
        let response = session.send(HttpRequest::get(ORDERS_PATH)).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        let response = response.error_for_status("order history")?;
        let orders = parse::parse_orders_html(&response.body)?;
        Ok(filter_orders(orders, include_history))
    }

    async fn get_order_details(&self, session: &mut SessionManager, order_id: &str) -> Result<Order> {
        let path = format!("{}{}/", ORDERS_PATH, urlencoding::encode(order_id));
        let response = session.send(HttpRequest::get(path)).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        if response.status == 404 {
            return Err(Error::OperationFailed(format!("order {} not found", order_id)));
        }
        let response = response.error_for_status("order details")?;
        parse::parse_order_details_html(&response.body, order_id)
    }
}

