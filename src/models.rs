//! Records parsed out of site responses.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A product listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Site identifier (SKU, catalog id or product code).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Current price in EUR.
    pub price: Option<f64>,
    /// Price before discount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
    /// Brand.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maker: Option<String>,
    /// Category or free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Package unit (kg, piece, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Barcode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ean: Option<String>,
    /// Product page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// In stock and saleable.
    pub available: bool,
}

impl Product {
    /// A product with only id and name set.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price: None,
            original_price: None,
            maker: None,
            description: None,
            unit: None,
            ean: None,
            url: None,
            image_url: None,
            available: true,
        }
    }
}

/// A line in the shopping cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    /// Product identifier, comparable with [`Product::id`].
    pub product_id: String,
    /// Display name, when the site reports one.
    pub name: String,
    /// Quantity in the cart. Weighed goods may be fractional.
    pub quantity: f64,
    /// Price per unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    /// Line total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<f64>,
    /// Site line id, when cart mutations address lines instead of products.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
}

/// Shopping cart snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    /// Cart lines.
    pub items: Vec<CartItem>,
    /// Total number of units.
    pub item_count: f64,
    /// Grand total in EUR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Grand total as displayed by the site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_text: Option<String>,
    /// Selected delivery slot, as displayed by the site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_slot: Option<String>,
}

impl Cart {
    /// Find the line for `product_id` (or for a line id equal to it).
    pub fn find(&self, product_id: &str) -> Option<&CartItem> {
        self.items
            .iter()
            .find(|item| item.product_id == product_id)
            .or_else(|| {
                self.items
                    .iter()
                    .find(|item| item.line_id.as_deref() == Some(product_id))
            })
    }

    /// Whether the cart holds nothing.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.item_count <= 0.0
    }
}

/// A line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Product name.
    pub name: String,
    /// Quantity ordered.
    pub quantity: f64,
    /// Unit price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    /// Line total.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<f64>,
}

/// A placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Site order id.
    pub id: String,
    /// Human-facing order number.
    pub number: String,
    /// Status as reported by the site, lowercased.
    pub status: String,
    /// Placement time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
    /// Order total in EUR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Lines, when fetched.
    #[serde(default)]
    pub items: Vec<OrderItem>,
    /// Delivery address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
    /// Scheduled delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_date: Option<NaiveDateTime>,
}

const ACTIVE_STATUSES: &[&str] = &[
    "pending",
    "confirmed",
    "processing",
    "σε εκκρεμότητα",
    "επιβεβαιώθηκε",
    "σε επεξεργασία",
];

impl Order {
    /// Whether the order is still in flight.
    pub fn is_active(&self) -> bool {
        let status = self.status.to_lowercase();
        ACTIVE_STATUSES.iter().any(|s| status.contains(s))
    }
}

/// A delivery window offered by the site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySlot {
    /// Window start.
    pub from: NaiveDateTime,
    /// Window end.
    pub to: NaiveDateTime,
    /// Display label.
    pub label: String,
}

/// Outcome of a site-level add-to-cart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddOutcome {
    /// Slot selected during the add, if one had to be chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_slot: Option<DeliverySlot>,
    /// Free-form confirmation from the site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Verified add-to-cart result returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddToCartResult {
    /// Product added.
    pub product_id: String,
    /// Quantity requested.
    pub quantity: u32,
    /// Quantity now in the cart.
    pub cart_quantity: f64,
    /// Slot selected during the add.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_slot: Option<DeliverySlot>,
    /// Cart after the add.
    pub cart: Cart,
}

/// Snapshot of the session state for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Site slug.
    pub site: String,
    /// Whether an authenticated session is held in memory.
    pub authenticated: bool,
    /// Account email.
    pub email: String,
    /// Number of cookies in the jar.
    pub cookie_count: usize,
    /// Delivery zone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Whether credentials are available for automatic login.
    pub credentials_configured: bool,
}
