//! HTTP plumbing between site clients and the network.
//!
//! [`Transport`] sends exactly one request and never follows redirects.
//! [`HttpSession`] layers the cookie jar on top and follows redirects
//! itself, so a login that sets its session cookie on a 302 is not lost. The
//! jar only travels to the site's own host and its subdomains; hops to other
//! hosts go out without it and their cookies are dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Url;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Cookie name → value.
pub type CookieJar = BTreeMap<String, String>;

/// Maximum number of redirects followed per request.
pub const MAX_REDIRECTS: usize = 10;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// No body.
    Empty,
    /// `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    /// `application/json`.
    Json(serde_json::Value),
}

/// One outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL, or a path relative to the site root.
    pub url: String,
    /// Query parameters appended to `url`.
    pub query: Vec<(String, String)>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: Body,
}

impl HttpRequest {
    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// GET `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// POST `url`.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Mark the request as an XHR, the way the sites' own scripts do.
    pub fn ajax(self) -> Self {
        self.header("X-Requested-With", "XMLHttpRequest")
    }

    /// Form body.
    pub fn form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Body::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// JSON body.
    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    /// Value of header `name`, case-insensitive.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Form field `name`, if the body is a form.
    pub fn form_value(&self, name: &str) -> Option<&str> {
        match &self.body {
            Body::Form(fields) => fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    /// Path component of the URL.
    pub fn path(&self) -> String {
        match Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self.url.split('?').next().unwrap_or_default().to_string(),
        }
    }

    fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value));
    }
}

/// One response, body fully read.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// URL that produced this response (the last hop after redirects).
    pub url: String,
    /// Headers in wire order; repeated headers appear repeatedly.
    pub headers: Vec<(String, String)>,
    /// Body text.
    pub body: String,
}

impl HttpResponse {
    /// A bare response, mostly for tests.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            url: String::new(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add a `Set-Cookie` header.
    pub fn with_cookie(self, name: &str, value: &str) -> Self {
        self.with_header("Set-Cookie", format!("{}={}; Path=/; HttpOnly", name, value))
    }

    /// JSON body with the matching content type.
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header("Content-Type", "application/json")
    }

    /// A redirect to `location`.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new(302, "").with_header("Location", location)
    }

    /// 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 3xx with a `Location` header.
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status) && self.header("location").is_some()
    }

    /// First header named `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the body is JSON, by content type or by shape.
    pub fn is_json(&self) -> bool {
        if self
            .header("content-type")
            .is_some_and(|ct| ct.contains("json"))
        {
            return true;
        }
        let trimmed = self.body.trim_start();
        (trimmed.starts_with('{') || trimmed.starts_with('['))
            && serde_json::from_str::<serde_json::Value>(&self.body).is_ok()
    }

    /// Decode the body as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            Error::UnrecognizedResponse(format!("expected JSON from {}: {}", self.url, e))
        })
    }

    /// Fail with [`Error::HttpStatus`] unless 2xx.
    pub fn error_for_status(self, context: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::HttpStatus {
                status: self.status,
                context: context.to_string(),
            })
        }
    }

    /// Cookies set by this response. A `None` value means the cookie was
    /// deleted.
    pub fn set_cookies(&self) -> Vec<(String, Option<String>)> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, v)| parse_set_cookie(v))
            .collect()
    }
}

/// Parse one `Set-Cookie` header value.
pub fn parse_set_cookie(header: &str) -> Option<(String, Option<String>)> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let value = value.trim().trim_matches('"');

    let mut max_age = None;
    let mut expires = None;
    for attr in parts {
        match attr.split_once('=') {
            Some((k, v)) if k.trim().eq_ignore_ascii_case("max-age") => {
                max_age = v.trim().parse::<i64>().ok();
            }
            Some((k, v)) if k.trim().eq_ignore_ascii_case("expires") => {
                expires = parse_cookie_date(v);
            }
            _ => {}
        }
    }
    // Max-Age wins over Expires.
    let expired = match max_age {
        Some(age) => age <= 0,
        None => expires.is_some_and(|at| at <= Utc::now()),
    };
    if expired || value.is_empty() || value == "deleted" {
        Some((name.to_string(), None))
    } else {
        Some((name.to_string(), Some(value.to_string())))
    }
}

/// `Expires` attribute value: RFC 1123 or the older dashed form
/// (`Thu, 01-Jan-1970 00:00:00 GMT`).
pub fn parse_cookie_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc2822(text) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%a, %d-%b-%Y %H:%M:%S GMT")
        .ok()
        .map(|at| at.and_utc())
}

/// Render a jar as a `Cookie` header value.
pub fn cookie_header(jar: &CookieJar) -> Option<String> {
    if jar.is_empty() {
        return None;
    }
    Some(
        jar.iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

/// Apply a response's `Set-Cookie` headers to `jar`. Returns whether
/// anything changed.
pub fn absorb_cookies(jar: &mut CookieJar, response: &HttpResponse) -> bool {
    let mut changed = false;
    for (name, value) in response.set_cookies() {
        match value {
            Some(value) => {
                if jar.get(&name) != Some(&value) {
                    jar.insert(name, value);
                    changed = true;
                }
            }
            None => changed |= jar.remove(&name).is_some(),
        }
    }
    changed
}

/// Sends one request; does not follow redirects.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send `request`. `request.url` is absolute.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// [`Transport`] backed by `reqwest`.
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with browser-like defaults.
    pub fn new(accept_language: &str) -> Result<Self> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        if let Ok(value) = reqwest::header::HeaderValue::from_str(accept_language) {
            default_headers.insert(reqwest::header::ACCEPT_LANGUAGE, value);
        }
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(default_headers)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = self.http.request(method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            Body::Empty => builder,
            Body::Form(fields) => builder.form(fields),
            Body::Json(value) => builder.json(value),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.text().await?;

        tracing::debug!(status, %url, bytes = body.len(), "site response");
        Ok(HttpResponse {
            status,
            url,
            headers,
            body,
        })
    }
}

/// A [`Transport`] bound to one site root, with cookie and redirect
/// handling.
#[derive(Clone)]
pub struct HttpSession {
    transport: Arc<dyn Transport>,
    base: Url,
}

impl HttpSession {
    /// Bind `transport` to `base_url`.
    pub fn new(transport: Arc<dyn Transport>, base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Internal(format!("invalid base URL {}: {}", base_url, e)))?;
        Ok(Self { transport, base })
    }

    /// Site root.
    pub fn base_url(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// Absolute URL for a site path.
    pub fn url(&self, path: &str) -> Result<String> {
        self.base
            .join(path)
            .map(|u| u.to_string())
            .map_err(|e| Error::Internal(format!("invalid path {}: {}", path, e)))
    }

    /// Whether `url` is on the site's host or one of its subdomains.
    pub fn is_same_site(&self, url: &Url) -> bool {
        match (url.host_str(), self.base.host_str()) {
            (Some(host), Some(base)) => {
                let host = host.to_ascii_lowercase();
                let base = base.to_ascii_lowercase();
                let base = base.strip_prefix("www.").unwrap_or(&base);
                host == base
                    || host
                        .strip_suffix(base)
                        .is_some_and(|sub| sub.ends_with('.'))
            }
            _ => false,
        }
    }

    /// Send `request` following redirects. On same-site hops `jar` is
    /// attached and `Set-Cookie` headers are absorbed into it.
    pub async fn send(&self, jar: &mut CookieJar, mut request: HttpRequest) -> Result<HttpResponse> {
        let mut url = self
            .base
            .join(&request.url)
            .map_err(|e| Error::Internal(format!("invalid URL {}: {}", request.url, e)))?;

        for _ in 0..=MAX_REDIRECTS {
            request.url = url.to_string();
            let same_site = self.is_same_site(&url);
            match cookie_header(jar).filter(|_| same_site) {
                Some(value) => request.set_header("Cookie", value),
                None => request.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("cookie")),
            }

            let mut response = self.transport.send(&request).await?;
            if same_site {
                absorb_cookies(jar, &response);
            } else if !response.set_cookies().is_empty() {
                tracing::debug!(%url, "ignoring cookies from another host");
            }

            if !response.is_redirect() {
                response.url = url.to_string();
                return Ok(response);
            }

            let location = response.header("location").unwrap_or_default().to_string();
            let next = url
                .join(&location)
                .map_err(|e| Error::UnrecognizedResponse(format!("bad redirect {}: {}", location, e)))?;
            tracing::debug!(from = %url, to = %next, status = response.status, "following redirect");

            // 303 always, 301/302 after POST: browsers switch to GET.
            if response.status == 303
                || (matches!(response.status, 301 | 302) && request.method == Method::Post)
            {
                request.method = Method::Get;
                request.body = Body::Empty;
                request.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
            }
            request.query.clear();
            url = next;
        }

        Err(Error::Network(format!(
            "too many redirects starting at {}",
            request.url
        )))
    }
}
