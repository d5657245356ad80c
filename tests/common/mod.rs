//! Shared fixtures: a scripted transport standing in for the sites.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use grocery_mcp::config::{Credentials, SiteConfig, SiteKind};
use grocery_mcp::error::{Error, Result};
use grocery_mcp::sites::Storefront;
use grocery_mcp::transport::{HttpRequest, HttpResponse, Method, Transport};
use tempfile::TempDir;

struct Route {
    method: Method,
    path: String,
    responses: VecDeque<HttpResponse>,
}

/// Answers requests by method and path. Each route replays its responses in
/// order and keeps repeating the last one. Every request is recorded.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `response` for `method path`.
    pub fn on(&self, method: Method, path: &str, response: HttpResponse) -> &Self {
        let mut routes = self.routes.lock().unwrap();
        match routes
            .iter_mut()
            .find(|r| r.method == method && r.path == path)
        {
            Some(route) => route.responses.push_back(response),
            None => routes.push(Route {
                method,
                path: path.to_string(),
                responses: VecDeque::from([response]),
            }),
        }
        self
    }

    pub fn get(&self, path: &str, response: HttpResponse) -> &Self {
        self.on(Method::Get, path, response)
    }

    pub fn post(&self, path: &str, response: HttpResponse) -> &Self {
        self.on(Method::Post, path, response)
    }

    /// Everything sent so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests sent to `path`.
    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path() == path)
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let path = request.path();
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .find(|r| r.method == request.method && r.path == path)
            .ok_or_else(|| {
                Error::Network(format!("no scripted response for {:?} {}", request.method, path))
            })?;
        let response = if route.responses.len() > 1 {
            route.responses.pop_front()
        } else {
            route.responses.front().cloned()
        };
        response.ok_or_else(|| Error::Network(format!("route {} has no responses", path)))
    }
}

pub fn session_path(dir: &TempDir) -> PathBuf {
    dir.path().join("session.json")
}

pub fn config(site: SiteKind, dir: &TempDir) -> SiteConfig {
    SiteConfig::new(site, site.base_url(), session_path(dir))
}

pub fn credentials() -> Credentials {
    Credentials::new("shopper@example.com", "hunter2")
}

pub fn storefront(config: &SiteConfig, transport: &Arc<ScriptedTransport>) -> Storefront {
    let transport: Arc<dyn Transport> = transport.clone();
    Storefront::with_transport(config, transport).unwrap()
}

/// Write a persisted session holding `cookie`.
pub fn write_session(path: &Path, cookie: (&str, &str)) {
    let mut cookies = serde_json::Map::new();
    cookies.insert(cookie.0.to_string(), cookie.1.into());
    let json = serde_json::json!({
        "cookies": cookies,
        "authenticated": true,
        "email": "shopper@example.com",
    });
    std::fs::write(path, json.to_string()).unwrap();
}

pub fn read_session(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

pub fn html(body: &str) -> HttpResponse {
    HttpResponse::new(200, body).with_header("Content-Type", "text/html; charset=utf-8")
}
