//! Cookie and redirect handling in `HttpSession`.

mod common;

use std::sync::Arc;

use common::{html, ScriptedTransport};
use grocery_mcp::error::Error;
use grocery_mcp::transport::{
    parse_set_cookie, CookieJar, HttpRequest, HttpResponse, HttpSession, Transport, MAX_REDIRECTS,
};
use tokio_test::{assert_err, assert_ok};

const AUTH_COOKIE: &str = ".AspNet.ApplicationCookie";

fn session(transport: &Arc<ScriptedTransport>) -> HttpSession {
    let transport: Arc<dyn Transport> = transport.clone();
    HttpSession::new(transport, "https://www.sklavenitis.gr").unwrap()
}

fn signed_in_jar() -> CookieJar {
    CookieJar::from([(AUTH_COOKIE.to_string(), "SECRET".to_string())])
}

#[tokio::test]
async fn redirect_to_another_host_drops_the_jar() {
    let transport = ScriptedTransport::new();
    transport
        .get("/start", HttpResponse::redirect("https://tracker.example.net/collect"))
        .get("/collect", html("ok").with_cookie("tracker_id", "t-1"));
    let http = session(&transport);
    let mut jar = signed_in_jar();

    let response = assert_ok!(http.send(&mut jar, HttpRequest::get("/start")).await);

    assert_eq!(response.url, "https://tracker.example.net/collect");
    let first = &transport.requests_to("/start")[0];
    assert_eq!(first.header_value("Cookie"), Some(".AspNet.ApplicationCookie=SECRET"));
    let second = &transport.requests_to("/collect")[0];
    assert_eq!(second.header_value("Cookie"), None);
    assert!(!jar.contains_key("tracker_id"));
    assert_eq!(jar.get(AUTH_COOKIE).map(String::as_str), Some("SECRET"));
}

#[tokio::test]
async fn subdomains_share_the_jar() {
    let transport = ScriptedTransport::new();
    transport
        .get("/start", HttpResponse::redirect("https://auth.sklavenitis.gr/sso"))
        .get("/sso", html("ok").with_cookie("sso", "s-1"));
    let http = session(&transport);
    let mut jar = signed_in_jar();

    assert_ok!(http.send(&mut jar, HttpRequest::get("/start")).await);

    let hop = &transport.requests_to("/sso")[0];
    assert_eq!(hop.header_value("Cookie"), Some(".AspNet.ApplicationCookie=SECRET"));
    assert_eq!(jar.get("sso").map(String::as_str), Some("s-1"));
}

#[test]
fn same_site_matching() {
    let http = session(&ScriptedTransport::new());
    let same = |url: &str| http.is_same_site(&reqwest::Url::parse(url).unwrap());

    assert!(same("https://www.sklavenitis.gr/gr/"));
    assert!(same("https://sklavenitis.gr/"));
    assert!(same("https://cdn.sklavenitis.gr/x.js"));
    assert!(!same("https://notsklavenitis.gr/"));
    assert!(!same("https://sklavenitis.gr.example.net/"));
    assert!(!same("https://tracker.example.net/collect"));
}

#[tokio::test]
async fn redirect_loop_stops_at_the_cap() {
    let transport = ScriptedTransport::new();
    transport.get("/loop", HttpResponse::redirect("/loop"));
    let http = session(&transport);
    let mut jar = CookieJar::new();

    let err = assert_err!(http.send(&mut jar, HttpRequest::get("/loop")).await);

    match err {
        Error::Network(message) => assert!(message.contains("too many redirects")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.count("/loop"), MAX_REDIRECTS + 1);
}

#[tokio::test]
async fn post_redirect_switches_to_get() {
    let transport = ScriptedTransport::new();
    transport
        .post("/form", HttpResponse::redirect("/done"))
        .get("/done", html("ok"));
    let http = session(&transport);
    let mut jar = CookieJar::new();

    let request = HttpRequest::post("/form").form([("a", "1")]);
    let response = assert_ok!(http.send(&mut jar, request).await);

    assert_eq!(response.url, "https://www.sklavenitis.gr/done");
    assert_eq!(transport.count("/done"), 1);
}

#[tokio::test]
async fn max_age_zero_deletes_the_cookie() {
    let transport = ScriptedTransport::new();
    transport.get(
        "/gr/account/logout/",
        HttpResponse::redirect("/gr/")
            .with_header("Set-Cookie", format!("{}=SECRET; Path=/; Max-Age=0", AUTH_COOKIE)),
    );
    transport.get("/gr/", html("bye"));
    let http = session(&transport);
    let mut jar = signed_in_jar();

    assert_ok!(http.send(&mut jar, HttpRequest::get("/gr/account/logout/")).await);

    assert!(!jar.contains_key(AUTH_COOKIE));
    assert_eq!(transport.requests_to("/gr/")[0].header_value("Cookie"), None);
}

#[tokio::test]
async fn empty_value_deletes_the_cookie() {
    let transport = ScriptedTransport::new();
    transport.get(
        "/gr/",
        html("bye").with_header("Set-Cookie", format!("{}=; Path=/", AUTH_COOKIE)),
    );
    let http = session(&transport);
    let mut jar = signed_in_jar();

    assert_ok!(http.send(&mut jar, HttpRequest::get("/gr/")).await);

    assert!(jar.is_empty());
}

#[test]
fn expires_is_compared_with_the_clock() {
    let past = parse_set_cookie("sid=abc; Expires=Wed, 21 Oct 2015 07:28:00 GMT; Path=/").unwrap();
    assert_eq!(past, ("sid".to_string(), None));

    let dashed = parse_set_cookie("sid=abc; expires=Thu, 01-Jan-1970 00:00:01 GMT").unwrap();
    assert_eq!(dashed.1, None);

    let future = parse_set_cookie("sid=abc; Expires=Fri, 01 Jan 2100 00:00:00 GMT").unwrap();
    assert_eq!(future.1.as_deref(), Some("abc"));

    // Max-Age takes precedence.
    let fresh =
        parse_set_cookie("sid=abc; Max-Age=3600; Expires=Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
    assert_eq!(fresh.1.as_deref(), Some("abc"));

    let unparseable = parse_set_cookie("sid=abc; Expires=someday").unwrap();
    assert_eq!(unparseable.1.as_deref(), Some("abc"));
}
