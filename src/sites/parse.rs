//! Parsing helpers shared by the site clients.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Order, OrderItem};
use crate::transport::HttpResponse;

/// Compile a CSS selector.
pub fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| Error::Internal(format!("bad selector {:?}: {:?}", css, e)))
}

/// Whitespace-normalized text content.
pub fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of the first descendant matching `css`, if non-empty.
pub fn first_text(element: ElementRef<'_>, css: &str) -> Result<Option<String>> {
    let sel = selector(css)?;
    Ok(element
        .select(&sel)
        .map(text_of)
        .find(|text| !text.is_empty()))
}

/// Attribute of the first descendant matching `css`.
pub fn first_attr(element: ElementRef<'_>, css: &str, attr: &str) -> Result<Option<String>> {
    let sel = selector(css)?;
    Ok(element
        .select(&sel)
        .find_map(|e| e.value().attr(attr))
        .map(str::to_string))
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"["'](?:csrf_token|csrfToken|_token)["']\s*:\s*["']([^"']+)["']"#)
            .expect("valid regex")
    })
}

/// Anti-forgery token from a page: `<meta name="csrf-token">`, a hidden
/// token input, or a token embedded in inline script.
pub fn extract_csrf_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let candidates = [
        ("meta[name=\"csrf-token\"]", "content"),
        ("input[name=\"__RequestVerificationToken\"]", "value"),
        ("input[name=\"authenticity_token\"]", "value"),
        ("input[name=\"csrf_token\"]", "value"),
        ("input[name=\"_token\"]", "value"),
    ];
    for (css, attr) in candidates {
        let Ok(sel) = Selector::parse(css) else {
            continue;
        };
        let found = document
            .select(&sel)
            .filter_map(|e| e.value().attr(attr))
            .find(|v| !v.is_empty());
        if let Some(token) = found {
            return Some(token.to_string());
        }
    }
    token_pattern()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether the page is a CAPTCHA or Cloudflare interstitial.
pub fn is_bot_challenge(html: &str) -> bool {
    let lower = html.to_lowercase();
    [
        "g-recaptcha",
        "grecaptcha.execute",
        "h-captcha",
        "challenge-running",
        "cf-challenge",
        "checking your browser",
        "<title>just a moment",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

/// Whether the page shows a logout control, i.e. the user is logged in.
pub fn has_logout_marker(html: &str) -> bool {
    let lower = html.to_lowercase();
    ["logout", "log out", "αποσύνδεση", "sign_out", "signout"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Map "sent back to the login page" and 401 to [`Error::SessionExpired`].
pub fn check_session(response: &HttpResponse, login_path: &str) -> Result<()> {
    let landed_on_login = reqwest::Url::parse(&response.url)
        .map(|u| u.path().trim_end_matches('/') == login_path.trim_end_matches('/'))
        .unwrap_or(false);
    if response.status == 401 || landed_on_login {
        return Err(Error::SessionExpired);
    }
    Ok(())
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d[\d.,]*").expect("valid regex"))
}

/// A plain decimal such as `0.500` or `12.9`, as sent in JSON strings.
pub fn parse_decimal(text: &str) -> Option<f64> {
    let text = text.trim();
    let plain = !text.is_empty()
        && text.matches('.').count() <= 1
        && text.trim_start_matches('-').chars().all(|c| c.is_ascii_digit() || c == '.');
    if !plain {
        return None;
    }
    text.parse().ok().filter(|n: &f64| n.is_finite())
}

/// Parse a displayed price such as `1.234,56 €`, `3,49€` or `12.90`.
pub fn parse_price(text: &str) -> Option<f64> {
    let raw = number_pattern().find(text)?.as_str().trim_end_matches(['.', ',']);
    let normalized = if raw.contains(',') {
        raw.replace('.', "").replace(',', ".")
    } else if let Some((whole, fraction)) = raw.rsplit_once('.') {
        // A group separator never follows a lone zero.
        if raw.matches('.').count() > 1 || (fraction.len() == 3 && whole != "0") {
            raw.replace('.', "")
        } else {
            raw.to_string()
        }
    } else {
        raw.to_string()
    };
    normalized.parse().ok()
}

fn euro_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d[\d.,]*)\s*€").expect("valid regex"))
}

/// First positive amount followed by a euro sign anywhere in `text`.
pub fn price_before_euro(text: &str) -> Option<f64> {
    euro_pattern()
        .captures_iter(text)
        .filter_map(|c| c.get(1).and_then(|m| parse_price(m.as_str())))
        .find(|price| *price > 0.0)
}

/// First present, non-null field among `keys`.
pub fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find(|v| !v.is_null())
}

/// A JSON number, or a string holding one.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_decimal(s).or_else(|| parse_price(s)),
        _ => None,
    }
}

/// A JSON string or number as text.
pub fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A JSON bool, or the strings `"true"`/`"false"`.
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Parse the timestamp formats the sites use.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    for format in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%d/%m/%Y %H:%M",
        "%d/%m/%Y %H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    for format in ["%d/%m/%Y", "%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Parse an order history page. Each order is an element carrying
/// `data-order-id`, with `.order-number`, `.order-status`, `.order-date`
/// and `.order-total` descendants.
pub fn parse_orders_html(html: &str) -> Result<Vec<Order>> {
    let document = Html::parse_document(html);
    let rows = selector("[data-order-id]")?;
    let mut orders = Vec::new();

    for row in document.select(&rows) {
        let Some(id) = row.value().attr("data-order-id").filter(|id| !id.is_empty()) else {
            continue;
        };
        let number = first_text(row, ".order-number")?.unwrap_or_else(|| id.to_string());
        let number = number.trim_start_matches('#').to_string();
        let status = first_text(row, ".order-status")?
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".into());
        let created_at = match first_attr(row, "time", "datetime")? {
            Some(stamp) => parse_datetime(&stamp),
            None => first_text(row, ".order-date")?.and_then(|d| parse_datetime(&d)),
        };
        let total = first_text(row, ".order-total")?.and_then(|t| parse_price(&t));

        orders.push(Order {
            id: id.to_string(),
            number,
            status,
            created_at,
            total,
            items: Vec::new(),
            delivery_address: first_text(row, ".order-address")?,
            delivery_date: first_text(row, ".order-delivery")?.and_then(|d| parse_datetime(&d)),
        });
    }

    Ok(orders)
}

/// Parse an order details page: order metadata as in
/// [`parse_orders_html`] plus `.order-item` lines with `.name`, `.quantity`,
/// `.price` and `.subtotal`.
pub fn parse_order_details_html(html: &str, order_id: &str) -> Result<Order> {
    let mut order = parse_orders_html(html)?
        .into_iter()
        .find(|o| o.id == order_id)
        .unwrap_or_else(|| Order {
            id: order_id.to_string(),
            number: order_id.to_string(),
            status: "unknown".into(),
            created_at: None,
            total: None,
            items: Vec::new(),
            delivery_address: None,
            delivery_date: None,
        });

    let document = Html::parse_document(html);
    let lines = selector(".order-item")?;
    for line in document.select(&lines) {
        let Some(name) = first_text(line, ".name")? else {
            continue;
        };
        let quantity = first_text(line, ".quantity")?
            .and_then(|q| parse_price(&q))
            .unwrap_or(1.0);
        let price = first_text(line, ".price")?.and_then(|p| parse_price(&p));
        let subtotal = first_text(line, ".subtotal")?
            .and_then(|s| parse_price(&s))
            .or(price.map(|p| p * quantity));
        order.items.push(OrderItem {
            name,
            quantity,
            price,
            subtotal,
        });
    }

    if order.items.is_empty() && order.status == "unknown" && order.total.is_none() {
        return Err(Error::UnrecognizedResponse(format!(
            "order page for {} has no order data",
            order_id
        )));
    }
    Ok(order)
}
