//! skroutz.gr (Rails marketplace).
//!
//! Cart lines belong to a shop offering, so adding needs the SKU's offering
//! first, and updates/removals address cart line ids rather than SKUs.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use scraper::Html;
use serde_json::{json, Value};

use super::parse::{self, as_f64, as_string, field};
use super::{filter_orders, SiteClient};
use crate::config::{Credentials, SiteKind};
use crate::error::{Error, LoginFailure, Result};
use crate::models::{AddOutcome, Cart, CartItem, Order, Product};
use crate::session::{CookieJar, LoginFlow, LoginOutcome, SessionManager};
use crate::transport::{HttpRequest, HttpResponse, HttpSession};

const LOGIN_PATH: &str = "/login";
const LOGOUT_PATH: &str = "/logout";
const ACCOUNT_PATH: &str = "/account";
const SEARCH_PATH: &str = "/search";
const CART_PATH: &str = "/cart";
const CART_JSON_PATH: &str = "/cart.json";
const CHANGE_QUANTITY_PATH: &str = "/cart/change_line_item_quantity.json";
const ORDERS_PATH: &str = "/account/orders";
const ORDER_DETAILS_PATH: &str = "/account/ecommerce/orders/";

const SESSION_COOKIES: &[&str] = &["_helmet_couch", "remember_user_token"];

const MAX_SEARCH_RESULTS: usize = 50;

fn sku_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/s/(\d+)").expect("valid regex"))
}

fn blocked(response: &HttpResponse) -> bool {
    response.status == 403 || parse::is_bot_challenge(&response.body)
}

fn on_login_page(response: &HttpResponse) -> bool {
    reqwest::Url::parse(&response.url)
        .map(|u| u.path().trim_end_matches('/') == LOGIN_PATH)
        .unwrap_or(false)
}

/// Skroutz two-step login.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkroutzLogin;

#[async_trait]
impl LoginFlow for SkroutzLogin {
    fn site(&self) -> SiteKind {
        SiteKind::Skroutz
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
        let page = http.send(jar, HttpRequest::get(LOGIN_PATH)).await?;
        if blocked(&page) {
            return Ok(LoginOutcome::Failed(LoginFailure::BotChallenge));
        }
        let page = page.error_for_status("login page")?;
        let Some(mut token) = parse::extract_csrf_token(&page.body) else {
            return Ok(LoginOutcome::Failed(LoginFailure::MissingToken));
        };

        let referer = http.url(LOGIN_PATH)?;
        let origin = http.base_url().to_string();

        let email_step = HttpRequest::post(LOGIN_PATH)
            .header("Referer", referer.as_str())
            .header("Origin", origin.as_str())
            .form([
                ("authenticity_token", token.as_str()),
                ("sign_in", "true"),
                ("user[username]", credentials.email.as_str()),
            ]);
        let mut response = http.send(jar, email_step).await?;
        if blocked(&response) {
            return Ok(LoginOutcome::Failed(LoginFailure::BotChallenge));
        }

        if response.is_success() && response.body.contains("user[password]") {
            tracing::debug!("password step");
            if let Some(next) = parse::extract_csrf_token(&response.body) {
                token = next;
            }
            let password_step = HttpRequest::post(LOGIN_PATH)
                .header("Referer", referer.as_str())
                .header("Origin", origin.as_str())
                .form([
                    ("authenticity_token", token.as_str()),
                    ("sign_in", "true"),
                    ("user[password]", credentials.password.as_str()),
                    ("user[remember_me]", "1"),
                ]);
            response = http.send(jar, password_step).await?;
            if blocked(&response) {
                return Ok(LoginOutcome::Failed(LoginFailure::BotChallenge));
            }
        }

        if on_login_page(&response) {
            return Ok(LoginOutcome::Failed(LoginFailure::InvalidCredentials));
        }

        let account = http.send(jar, HttpRequest::get(ACCOUNT_PATH)).await?;
        if blocked(&account) {
            return Ok(LoginOutcome::Failed(LoginFailure::BotChallenge));
        }
        let lower = account.body.to_lowercase();
        if account.is_success()
            && !on_login_page(&account)
            && (parse::has_logout_marker(&account.body) || lower.contains("λογαριασμός"))
        {
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

/// The shop offering a cart add is made against.
#[derive(Debug, Clone, PartialEq)]
pub struct Offering {
    /// Site product (offer) id.
    pub product_id: i64,
    /// Merchant id.
    pub shop_id: i64,
    /// Offer price.
    pub price: f64,
}

/// First offering listed in a SKU JSON document.
pub fn parse_offering(value: &Value) -> Option<Offering> {
    let offerings = field(value, &["offerings", "offers"])
        .or_else(|| value.get("sku").and_then(|sku| field(sku, &["offerings", "offers"])))?
        .as_array()?;
    offerings.iter().find_map(|offer| {
        let product_id = field(offer, &["product_id", "productId", "id"])
            .and_then(as_string)?
            .parse()
            .ok()?;
        let shop_id = field(offer, &["shop_id", "shopId"])
            .and_then(as_string)?
            .parse()
            .ok()?;
        let price = field(offer, &["price", "final_price", "finalPrice"])
            .and_then(as_f64)
            .unwrap_or(0.0);
        Some(Offering {
            product_id,
            shop_id,
            price,
        })
    })
}

/// Parse search result cards, skipping sponsored entries.
pub fn parse_search(html: &str, base_url: &str) -> Result<Vec<Product>> {
    let document = Html::parse_document(html);
    let cards = parse::selector("li[data-skuid]")?;
    let links = parse::selector("a[href]")?;
    let prices = parse::selector("[class*=\"price\"]")?;
    let images = parse::selector("img")?;

    let mut products: Vec<Product> = Vec::new();
    for card in document.select(&cards) {
        let attrs = card.value();
        let sponsored = attrs
            .classes()
            .any(|c| matches!(c, "labeled-product" | "labeled-item" | "product-ad"))
            || attrs.attr("data-ad").is_some()
            || attrs.attr("data-sponsored").is_some();
        if sponsored {
            continue;
        }

        let Some(link) = card
            .select(&links)
            .find(|a| a.value().attr("href").is_some_and(|h| sku_link_pattern().is_match(h)))
        else {
            continue;
        };
        let href = link.value().attr("href").unwrap_or_default();
        let id = attrs
            .attr("data-skuid")
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| {
                sku_link_pattern()
                    .captures(href)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            });
        let name = link
            .value()
            .attr("title")
            .map(str::to_string)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| parse::text_of(link));
        let (Some(id), false) = (id, name.is_empty()) else {
            continue;
        };
        if products.iter().any(|p| p.id == id) {
            continue;
        }

        let text = parse::text_of(card);
        let price = card
            .select(&prices)
            .find_map(|e| parse::parse_price(&parse::text_of(e)))
            .or_else(|| parse::price_before_euro(&text));
        let lower = text.to_lowercase();
        let available = !["εξαντλημένο", "out of stock", "μη διαθέσιμο"]
            .iter()
            .any(|phrase| lower.contains(phrase));
        let image_url = card.select(&images).find_map(|img| {
            img.value()
                .attr("src")
                .or_else(|| img.value().attr("data-src"))
                .map(str::to_string)
        });
        let path = href.split('?').next().unwrap_or(href);
        let url = if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", base_url, path)
        };

        let mut product = Product::new(id, name);
        product.price = price;
        product.available = available;
        product.image_url = image_url;
        product.url = Some(url);
        products.push(product);

        if products.len() >= MAX_SEARCH_RESULTS {
            break;
        }
    }
    Ok(products)
}

/// Parse `/cart.json`.
pub fn parse_cart(value: &Value) -> Result<Cart> {
    let cart = value
        .get("cart")
        .ok_or_else(|| Error::UnrecognizedResponse("cart JSON has no cart object".into()))?;
    let Some(proposal) = cart
        .get("proposals")
        .and_then(Value::as_array)
        .and_then(|p| p.first())
    else {
        return Ok(Cart::default());
    };

    let total_text = proposal
        .get("summary")
        .and_then(|s| s.get("total_cost"))
        .and_then(as_string);
    let total = total_text.as_deref().and_then(parse::parse_price);

    let items: Vec<CartItem> = proposal
        .get("packages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|package| package.get("items").and_then(Value::as_array))
        .flatten()
        .filter_map(|item| {
            let line_id = field(item, &["id"]).and_then(as_string)?;
            let product_id = field(item, &["sku_id"])
                .and_then(as_string)
                .unwrap_or_else(|| line_id.clone());
            let quantity = field(item, &["quantity"]).and_then(as_f64).unwrap_or(1.0);
            let subtotal = field(item, &["total_cost"]).and_then(as_f64);
            Some(CartItem {
                product_id,
                name: field(item, &["name"])
                    .and_then(as_string)
                    .unwrap_or_else(|| "Unknown".into()),
                quantity,
                unit_price: subtotal.filter(|_| quantity > 0.0).map(|s| s / quantity),
                subtotal,
                line_id: Some(line_id),
            })
        })
        .collect();

    Ok(Cart {
        item_count: items.iter().fold(0.0, |sum, i| sum + i.quantity),
        items,
        total,
        total_text,
        delivery_slot: None,
    })
}

/// Skroutz catalog and cart.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkroutzClient;

impl SkroutzClient {
    async fn fresh_csrf_token(&self, session: &mut SessionManager) -> Result<String> {
        let response = session.send(HttpRequest::get(CART_PATH)).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        if response.is_success() {
            session.set_csrf_token(parse::extract_csrf_token(&response.body));
        }
        session
            .record()
            .csrf_token
            .clone()
            .ok_or_else(|| Error::UnrecognizedResponse("cart page carried no CSRF token".into()))
    }

    async fn line_id(&self, session: &mut SessionManager, product_id: &str) -> Result<String> {
        let cart = self.get_cart(session).await?;
        cart.find(product_id)
            .and_then(|item| item.line_id.clone())
            .ok_or_else(|| Error::OperationFailed(format!("product {} is not in the cart", product_id)))
    }

    async fn change_quantity(
        &self,
        session: &mut SessionManager,
        line_id: &str,
        quantity: u32,
    ) -> Result<()> {
        let line_item_id: i64 = line_id
            .parse()
            .map_err(|_| Error::UnrecognizedResponse(format!("non-numeric line id {}", line_id)))?;
        let token = self.fresh_csrf_token(session).await?;
        let referer = session.http().url(CART_PATH)?;
        let request = HttpRequest::post(CHANGE_QUANTITY_PATH)
            .ajax()
            .header("Accept", "application/json")
            .header("X-CSRF-Token", token)
            .header("Referer", referer)
            .json(json!({
                "line_item_id": line_item_id,
                "quantity": quantity,
                "from_sku_page": false,
            }));
        let response = session.send(request).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        check_mutation(response, "cart quantity change")
    }
}

fn check_mutation(response: HttpResponse, context: &str) -> Result<()> {
    if response.status == 422 {
        let message = response
            .json_body::<Value>()
            .ok()
            .and_then(|v| field(&v, &["error", "message"]).and_then(as_string))
            .unwrap_or_else(|| format!("{} was rejected", context));
        return Err(Error::OperationFailed(message));
    }
    response.error_for_status(context).map(|_| ())
}

#[async_trait]
impl SiteClient for SkroutzClient {
    fn kind(&self) -> SiteKind {
        SiteKind::Skroutz
    }

    async fn search(&self, session: &mut SessionManager, query: &str) -> Result<Vec<Product>> {
        let response = session
            .send(HttpRequest::get(SEARCH_PATH).query("keyphrase", query))
            .await?;
        if blocked(&response) {
            return Err(Error::UnrecognizedResponse("search was blocked by a bot challenge".into()));
        }
        let response = response.error_for_status("search")?;
        let products = parse_search(&response.body, session.http().base_url())?;
        tracing::debug!(query, results = products.len(), "search finished");
        Ok(products)
    }

    async fn add_to_cart(
        &self,
        session: &mut SessionManager,
        product_id: &str,
        quantity: u32,
    ) -> Result<AddOutcome> {
        let sku_path = format!("/s/{}.json", urlencoding::encode(product_id));
        let response = session
            .send(HttpRequest::get(sku_path).ajax().header("Accept", "application/json"))
            .await?;
        if response.status == 404 {
            return Err(Error::OperationFailed(format!("product {} not found", product_id)));
        }
        let response = response.error_for_status("product lookup")?;
        let offering = parse_offering(&response.json_body()?)
            .ok_or_else(|| Error::OperationFailed(format!("product {} has no offering to buy", product_id)))?;
        tracing::debug!(product_id, shop_id = offering.shop_id, price = offering.price, "offering selected");

        let token = self.fresh_csrf_token(session).await?;
        let referer = session.http().url(&format!("/s/{}", product_id))?;
        let request = HttpRequest::post(format!("/cart/add/{}.json", urlencoding::encode(product_id)))
            .ajax()
            .header("Accept", "application/json")
            .header("X-CSRF-Token", token)
            .header("Referer", referer)
            .json(json!({
                "product_id": offering.product_id,
                "assortments": {},
                "from": "sku",
                "offering_type": "default",
                "express": null,
                "recommendation_source_sku_id": null,
                "offerings": [{
                    "shop_id": offering.shop_id,
                    "type": "default",
                    "price": offering.price,
                    "pro": false,
                    "order": 0,
                    "expanded": true,
                }],
            }));
        let response = session.send(request).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        let message = response
            .json_body::<Value>()
            .ok()
            .and_then(|v| v.get("cart_items_count").and_then(as_string))
            .map(|count| format!("{} items in cart", count));
        check_mutation(response, "add to cart")?;

        if quantity > 1 {
            let line_id = self.line_id(session, product_id).await?;
            self.change_quantity(session, &line_id, quantity).await?;
        }
        Ok(AddOutcome {
            selected_slot: None,
            message,
        })
    }

    async fn remove_from_cart(&self, session: &mut SessionManager, product_id: &str) -> Result<()> {
        let line_id = self.line_id(session, product_id).await?;
        let token = self.fresh_csrf_token(session).await?;
        let request = HttpRequest::post(format!("/cart/remove_line_item/{}", urlencoding::encode(&line_id)))
            .ajax()
            .header("X-CSRF-Token", token);
        let response = session.send(request).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        check_mutation(response, "cart removal")
    }

    async fn update_cart_item(
        &self,
        session: &mut SessionManager,
        product_id: &str,
        quantity: u32,
    ) -> Result<()> {
        let line_id = self.line_id(session, product_id).await?;
        self.change_quantity(session, &line_id, quantity).await
    }

    async fn get_cart(&self, session: &mut SessionManager) -> Result<Cart> {
        let referer = session.http().url(CART_PATH)?;
        let request = HttpRequest::get(CART_JSON_PATH)
            .header("Accept", "application/json")
            .header("Referer", referer);
        let response = session.send(request).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        if blocked(&response) {
            return Err(Error::UnrecognizedResponse("cart was blocked by a bot challenge".into()));
        }
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
        let path = format!("{}{}", ORDER_DETAILS_PATH, urlencoding::encode(order_id));
        let response = session.send(HttpRequest::get(path)).await?;
        parse::check_session(&response, LOGIN_PATH)?;
        if response.status == 404 {
            return Err(Error::OperationFailed(format!("order {} not found", order_id)));
        }
        let response = response.error_for_status("order details")?;
        parse::parse_order_details_html(&response.body, order_id)
    }
}
