//! Sklavenitis client: search, the two-step cart add, delivery setup and
//! transparent re-login.

mod common;

use common::{config, credentials, html, read_session, session_path, storefront, write_session, ScriptedTransport};
use grocery_mcp::config::SiteKind;
use grocery_mcp::error::Error;
use grocery_mcp::session::LoginFlow;
use grocery_mcp::sites::sklavenitis::{
    self, SklavenitisLogin, DELIVERY_SETUP_STEP,
};
use grocery_mcp::transport::HttpResponse;
use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const LOGIN: &str = "/gr/account/login/";
const SEARCH: &str = "/gr/ajax/Atcom.Sites.Yoda.Components.Autocomplete.SearchAutocomplete/";
const USER_FLOW: &str = "/gr/ajax/Atcom.Sites.Yoda.Components.UserFlow.AddToCartUserFlow.Index/";
const CART: &str = "/gr/ajax/Atcom.Sites.Yoda.Components.ClientContext.Index/";
const ORDERS: &str = "/gr/account/orders/";
const AUTH_COOKIE: &str = ".AspNet.ApplicationCookie";

fn logged_in(dir: &TempDir) -> grocery_mcp::config::SiteConfig {
    write_session(&session_path(dir), (AUTH_COOKIE, "cached"));
    config(SiteKind::Sklavenitis, dir)
}

fn milk_cart(quantity: u32) -> HttpResponse {
    HttpResponse::json(
        200,
        json!({
            "IsAuthenticated": true,
            "Items": {
                "1631417": {
                    "Name": "Γάλα Φρέσκο Πλήρες 1lt",
                    "CartQuantity": quantity,
                    "Price": "1,29 €"
                }
            },
            "SummaryText": quantity.to_string(),
            "GrandTotal": "1,29 €",
            "SlotInfoWithDay": "Σάββατο 18/10 10:00 - 12:00"
        }),
    )
}

fn empty_cart() -> HttpResponse {
    HttpResponse::json(200, json!({"IsAuthenticated": true, "Items": {}, "GrandTotal": "0,00 €"}))
}

const SLOT_PICKER: &str = r#"<div class="timeslots" data-step="TimeSlotSelection">
  <button class="timeslot full" data-timeslot-from="2026-10-17 08:00:00" data-timeslot-to="2026-10-17 10:00:00">Παρ 08:00 - 10:00</button>
  <button class="timeslot" data-available="false" data-timeslot-from="2026-10-17 09:00:00" data-timeslot-to="2026-10-17 11:00:00">Παρ 09:00 - 11:00</button>
  <button class="timeslot" data-timeslot-from="2026-10-17 10:00:00" data-timeslot-to="2026-10-17 12:00:00">Παρ 10:00 - 12:00</button>
  <button class="timeslot" data-timeslot-from="2026-10-17 12:00:00" data-timeslot-to="2026-10-17 14:00:00">Παρ 12:00 - 14:00</button>
</div>"#;

#[tokio::test]
async fn search_returns_products_in_site_order_without_login() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport.get(
        SEARCH,
        HttpResponse::json(
            200,
            json!([
                {"label": "Γάλα Φρέσκο Πλήρες 1lt", "url": "/gr/galata/gala-fresko-plires-1lt-1631417/", "category": "Γάλατα", "price": "1,29 €"},
                {"label": "Γάλα Ελαφρύ 1,5% 1lt", "url": "/gr/galata/gala-elafry-1lt-1631420/", "category": "Γάλατα", "price": 1.19},
                {"label": "Κατηγορία Γάλατα", "url": "/gr/galata/"}
            ]),
        ),
    );
    let mut shop = storefront(&config(SiteKind::Sklavenitis, &dir), &transport);

    let products = assert_ok!(shop.search("  milk ").await);

    assert_eq!(products.len(), 2);
    assert_eq!(products[0].id, "1631417");
    assert_eq!(products[0].price, Some(1.29));
    assert_eq!(products[1].id, "1631420");
    assert_eq!(products[1].price, Some(1.19));
    assert_eq!(products[0].description.as_deref(), Some("Γάλατα"));

    let sent = &transport.requests_to(SEARCH)[0];
    assert!(sent.query.contains(&("term".to_string(), "milk".to_string())));
    assert!(!shop.session().is_authenticated());
}

#[tokio::test]
async fn empty_query_is_rejected_before_any_request() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    let mut shop = storefront(&config(SiteKind::Sklavenitis, &dir), &transport);

    let err = assert_err!(shop.search("   ").await);
    assert!(matches!(err, Error::InvalidParams(_)));
    let err = assert_err!(shop.add_to_cart("1631417", 0).await);
    assert!(matches!(err, Error::InvalidParams(_)));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn add_then_get_cart_shows_the_product() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport
        .post(USER_FLOW, HttpResponse::json(200, json!({"Success": true, "Message": "Προστέθηκε"})))
        .post(CART, milk_cart(1));
    let mut shop = storefront(&logged_in(&dir), &transport);

    let added = assert_ok!(shop.add_to_cart("1631417", 1).await);
    assert_eq!(added.product_id, "1631417");
    assert_eq!(added.cart_quantity, 1.0);
    assert!(added.selected_slot.is_none());

    let cart = assert_ok!(shop.get_cart().await);
    let item = cart.find("1631417").unwrap();
    assert_eq!(item.quantity, 1.0);
    assert_eq!(item.unit_price, Some(1.29));
    assert_eq!(cart.total, Some(1.29));
    assert_eq!(cart.delivery_slot.as_deref(), Some("Σάββατο 18/10 10:00 - 12:00"));

    let flow = &transport.requests_to(USER_FLOW)[0];
    assert_eq!(flow.form_value("CartItems[0][ProductSKU]"), Some("1631417"));
    assert_eq!(flow.form_value("CartItems[0][Quantity]"), Some("1"));
    assert_eq!(flow.header_value("X-UserFlow-New"), Some("true"));
}

#[tokio::test]
async fn repeated_add_with_slot_selected_sends_no_slot_request() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport
        .post(USER_FLOW, HttpResponse::json(200, json!({"Success": true})))
        .post(CART, milk_cart(2));
    let mut shop = storefront(&logged_in(&dir), &transport);

    assert_ok!(shop.add_to_cart("1631417", 1).await);
    assert_ok!(shop.add_to_cart("1631417", 2).await);

    let flows = transport.requests_to(USER_FLOW);
    assert_eq!(flows.len(), 2);
    assert!(flows.iter().all(|r| r.header_value("X-NoRedirect").is_none()));
    assert!(flows.iter().all(|r| r.form_value("TimeSlotDate").is_none()));
}

#[tokio::test]
async fn slot_picker_selects_first_available_slot() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport
        .post(USER_FLOW, html(SLOT_PICKER))
        .post(USER_FLOW, HttpResponse::json(200, json!({"Success": true})))
        .post(CART, milk_cart(1));
    let mut shop = storefront(&logged_in(&dir), &transport);

    let added = assert_ok!(shop.add_to_cart("1631417", 1).await);

    let slot = added.selected_slot.unwrap();
    assert_eq!(slot.label, "Παρ 10:00 - 12:00");
    let flows = transport.requests_to(USER_FLOW);
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[1].form_value("TimeSlotDate"), Some("2026-10-17 10:00:00"));
    assert_eq!(flows[1].form_value("TimeSlotDateTo"), Some("2026-10-17 12:00:00"));
    assert_eq!(flows[1].header_value("X-NoRedirect"), Some("true"));
}

#[tokio::test]
async fn address_step_in_json_is_delivery_setup_required() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport.post(
        USER_FLOW,
        HttpResponse::json(200, json!({"Action": DELIVERY_SETUP_STEP, "Success": false})),
    );
    let mut shop = storefront(&logged_in(&dir), &transport);

    let err = assert_err!(shop.add_to_cart("1631417", 1).await);
    assert!(matches!(err, Error::DeliverySetupRequired(_)));
    assert_eq!(transport.count(CART), 0);
}

#[tokio::test]
async fn address_step_in_html_is_delivery_setup_required() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport.post(
        USER_FLOW,
        html(r#"<div class="user-flow" data-step="AddressSelection"><form>...</form></div>"#),
    );
    let mut shop = storefront(&logged_in(&dir), &transport);

    let err = assert_err!(shop.add_to_cart("1631417", 1).await);
    assert!(matches!(err, Error::DeliverySetupRequired(_)));
}

#[tokio::test]
async fn site_refusal_carries_the_site_message() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport.post(
        USER_FLOW,
        HttpResponse::json(200, json!({"Success": false, "Message": "Το προϊόν δεν είναι διαθέσιμο"})),
    );
    let mut shop = storefront(&logged_in(&dir), &transport);

    match assert_err!(shop.add_to_cart("1631417", 1).await) {
        Error::OperationFailed(message) => assert_eq!(message, "Το προϊόν δεν είναι διαθέσιμο"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn accepted_add_missing_from_cart_is_an_error() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport
        .post(USER_FLOW, HttpResponse::json(200, json!({"Success": true})))
        .post(CART, empty_cart());
    let mut shop = storefront(&logged_in(&dir), &transport);

    let err = assert_err!(shop.add_to_cart("1631417", 1).await);
    assert!(matches!(err, Error::OperationFailed(_)));
}

#[tokio::test]
async fn remove_sets_quantity_zero_and_verifies() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport
        .post(USER_FLOW, HttpResponse::json(200, json!({"Success": true})))
        .post(CART, empty_cart());
    let mut shop = storefront(&logged_in(&dir), &transport);

    let cart = assert_ok!(shop.remove_from_cart("1631417").await);

    assert!(cart.is_empty());
    let flow = &transport.requests_to(USER_FLOW)[0];
    assert_eq!(flow.form_value("CartItems[0][Quantity]"), Some("0"));
}

#[tokio::test]
async fn stale_session_relogs_in_and_retries_once() {
    let dir = TempDir::new().unwrap();
    write_session(&session_path(&dir), (AUTH_COOKIE, "stale"));
    let transport = ScriptedTransport::new();
    transport
        .post(CART, HttpResponse::redirect(LOGIN))
        .post(CART, milk_cart(1))
        .get(
            LOGIN,
            html(r#"<form><input name="__RequestVerificationToken" type="hidden" value="fresh-token"/></form>"#),
        )
        .post(LOGIN, HttpResponse::redirect("/gr/").with_cookie(AUTH_COOKIE, "fresh"))
        .get("/gr/", html(r#"<a href="/gr/account/logout/">Αποσύνδεση</a>"#));
    let config = config(SiteKind::Sklavenitis, &dir).with_credentials(credentials());
    let mut shop = storefront(&config, &transport);
    assert!(shop.session().is_authenticated());

    let cart = assert_ok!(shop.get_cart().await);

    assert!(cart.find("1631417").is_some());
    assert_eq!(transport.count(CART), 2);
    let login_posts = transport
        .requests_to(LOGIN)
        .into_iter()
        .filter(|r| r.form_value("UserName").is_some())
        .count();
    assert_eq!(login_posts, 1);
    let saved = read_session(&session_path(&dir));
    assert_eq!(saved["cookies"][AUTH_COOKIE], "fresh");
}

#[tokio::test]
async fn stale_session_without_credentials_requires_authentication() {
    let dir = TempDir::new().unwrap();
    write_session(&session_path(&dir), (AUTH_COOKIE, "stale"));
    let transport = ScriptedTransport::new();
    transport
        .post(CART, HttpResponse::new(401, ""));
    let mut shop = storefront(&config(SiteKind::Sklavenitis, &dir), &transport);

    let err = assert_err!(shop.get_cart().await);

    assert!(matches!(err, Error::AuthenticationRequired(_)));
    assert!(!shop.session().is_authenticated());
    assert_eq!(transport.count(CART), 1);
}

#[tokio::test]
async fn orders_filter_history() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport.get(
        ORDERS,
        html(
            r#"<table>
            <tr data-order-id="9001"><td class="order-number">#A-9001</td><td class="order-status">Σε επεξεργασία</td>
                <td><time datetime="2026-10-14T09:30:00+03:00">14/10</time></td><td class="order-total">54,30 €</td></tr>
            <tr data-order-id="8800"><td class="order-number">#A-8800</td><td class="order-status">Delivered</td>
                <td class="order-date">01/09/2026 18:00</td><td class="order-total">1.204,10 €</td></tr>
            </table>"#,
        ),
    );
    let mut shop = storefront(&logged_in(&dir), &transport);

    let all = assert_ok!(shop.get_orders(true, false).await);
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].number, "A-9001");
    assert_eq!(all[1].total, Some(1204.10));
    assert!(all[1].created_at.is_some());

    let active = assert_ok!(shop.get_orders(false, false).await);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "9001");
}

#[tokio::test]
async fn order_details_list_items() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport.get(
        "/gr/account/orders/9001/",
        html(
            r#"<div data-order-id="9001"><span class="order-status">Confirmed</span><span class="order-total">4,87 €</span>
            <span class="order-address">Πανεπιστημίου 1, Αθήνα</span></div>
            <ul>
              <li class="order-item"><span class="name">Γάλα 1lt</span><span class="quantity">2</span><span class="price">1,29 €</span></li>
              <li class="order-item"><span class="name">Ψωμί</span><span class="quantity">1</span><span class="price">2,29 €</span><span class="subtotal">2,29 €</span></li>
            </ul>"#,
        ),
    );
    let mut shop = storefront(&logged_in(&dir), &transport);

    let order = assert_ok!(shop.get_order_details("9001").await);

    assert_eq!(order.status, "confirmed");
    assert_eq!(order.items.len(), 2);
    assert_eq!(order.items[0].subtotal, Some(2.58));
    assert_eq!(order.delivery_address.as_deref(), Some("Πανεπιστημίου 1, Αθήνα"));
}

#[test]
fn sku_comes_from_the_product_url() {
    let products = sklavenitis::parse_search(&json!({
        "Items": [
            {"label": "Φέτα ΠΟΠ 400g", "url": "https://www.sklavenitis.gr/gr/tyria/feta-pop-400g-2140011/"},
            {"label": "Χωρίς κωδικό", "url": "/gr/tyria/"}
        ]
    }))
    .unwrap();

    assert_eq!(products.len(), 1);
    assert_eq!(products[0].id, "2140011");
    assert_eq!(products[0].price, None);
}

#[test]
fn numeric_zone_becomes_hub_cookie() {
    let login = SklavenitisLogin;
    assert_eq!(
        login.zone_cookie("11141"),
        Some(("Zone".to_string(), r#"{"ShippingType":1,"HubID":11141}"#.to_string()))
    );
    assert_eq!(login.zone_cookie("Athens"), None);
}

#[test]
fn unavailable_slots_are_skipped() {
    let slots = sklavenitis::parse_delivery_slots(SLOT_PICKER).unwrap();

    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].label, "Παρ 10:00 - 12:00");
    assert!(slots[0].from < slots[1].from);
}

#[test]
fn unauthenticated_cart_is_session_expired() {
    let err = sklavenitis::parse_cart(&json!({"IsAuthenticated": false, "Items": {}})).unwrap_err();
    assert!(matches!(err, Error::SessionExpired));
}

#[test]
fn cart_items_as_array() {
    let cart = sklavenitis::parse_cart(&json!({
        "Items": [
            {"ProductSKU": "1631417", "Name": "Γάλα", "Quantity": 3, "Price": 1.0, "Total": 3.0},
            {"Name": "χωρίς κωδικό", "Quantity": 1}
        ],
        "GrandTotal": "3,00 €"
    }))
    .unwrap();

    assert_eq!(cart.items.len(), 1);
    assert_eq!(cart.item_count, 3.0);
    assert_eq!(cart.total, Some(3.0));
}

#[test]
fn delivery_setup_markers() {
    assert!(sklavenitis::requires_delivery_setup_json(&json!({"NextStep": "AddressSelection"})));
    assert!(!sklavenitis::requires_delivery_setup_json(&json!({"Action": "Update"})));
    assert!(sklavenitis::requires_delivery_setup_html("<div data-step='AddressSelection'></div>"));
    assert!(!sklavenitis::requires_delivery_setup_html("<div data-step=\"TimeSlotSelection\"></div>"));
}

#[tokio::test]
async fn cart_without_items_is_unrecognized() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new();
    transport.post(
        CART,
        HttpResponse::json(200, json!({"IsAuthenticated": true, "Basket": {"Lines": []}})),
    );
    let mut shop = storefront(&logged_in(&dir), &transport);

    let err = assert_err!(shop.get_cart().await);
    assert!(matches!(err, Error::UnrecognizedResponse(_)));
    // Not treated as an expired session.
    assert_eq!(transport.count(LOGIN), 0);
}

#[test]
fn cart_shapes() {
    assert!(matches!(
        sklavenitis::parse_cart(&json!({})),
        Err(Error::UnrecognizedResponse(_))
    ));
    assert!(matches!(
        sklavenitis::parse_cart(&json!([])),
        Err(Error::UnrecognizedResponse(_))
    ));

    let empty = sklavenitis::parse_cart(&json!({"Items": null})).unwrap();
    assert!(empty.items.is_empty());
    assert!(empty.item_count.is_sign_positive());
}
