//! Site clients and the [`Storefront`] that drives them.
//!
//! A [`SiteClient`] knows one site's endpoints and response shapes. It is
//! handed the [`SessionManager`] on every call and sends all traffic through
//! it. The [`Storefront`] owns both, validates input, establishes the session
//! and retries an operation once when the site reports the session expired.

pub mod efresh;
pub mod parse;
pub mod sklavenitis;
pub mod skroutz;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Credentials, Language, SiteConfig, SiteKind};
use crate::error::{Error, Result};
use crate::models::{AddOutcome, AddToCartResult, Cart, Order, Product, SessionStatus};
use crate::session::{LoginFlow, SessionManager, SessionStore};
use crate::transport::{HttpSession, ReqwestTransport, Transport};

/// Operations every site supports.
#[async_trait]
pub trait SiteClient: Send + Sync {
    /// Which site.
    fn kind(&self) -> SiteKind;

    /// Search the catalog. Results keep the site's relevance order.
    async fn search(&self, session: &mut SessionManager, query: &str) -> Result<Vec<Product>>;

    /// Put `quantity` of `product_id` in the cart. Returns once the site has
    /// accepted the request; the caller confirms by reading the cart.
    async fn add_to_cart(
        &self,
        session: &mut SessionManager,
        product_id: &str,
        quantity: u32,
    ) -> Result<AddOutcome>;

    /// Remove the product's line from the cart.
    async fn remove_from_cart(&self, session: &mut SessionManager, product_id: &str) -> Result<()>;

    /// Set the quantity of a product already in the cart.
    async fn update_cart_item(
        &self,
        session: &mut SessionManager,
        product_id: &str,
        quantity: u32,
    ) -> Result<()>;

    /// Current cart.
    async fn get_cart(&self, session: &mut SessionManager) -> Result<Cart>;

    /// Orders, newest first. Without `include_history` only active orders.
    async fn get_orders(&self, session: &mut SessionManager, include_history: bool) -> Result<Vec<Order>>;

    /// One order with its lines.
    async fn get_order_details(&self, session: &mut SessionManager, order_id: &str) -> Result<Order>;
}

/// Keep only active orders unless history was asked for.
pub(crate) fn filter_orders(orders: Vec<Order>, include_history: bool) -> Vec<Order> {
    if include_history {
        orders
    } else {
        orders.into_iter().filter(Order::is_active).collect()
    }
}

/// Login flow and client for `site`.
pub fn site_parts(
    site: SiteKind,
    language: Language,
) -> (Box<dyn LoginFlow>, Box<dyn SiteClient>) {
    match site {
        SiteKind::Sklavenitis => (
            Box::new(sklavenitis::SklavenitisLogin),
            Box::new(sklavenitis::SklavenitisClient),
        ),
        SiteKind::Skroutz => (
            Box::new(skroutz::SkroutzLogin),
            Box::new(skroutz::SkroutzClient),
        ),
        SiteKind::Efresh => (
            Box::new(efresh::EfreshLogin::new(language)),
            Box::new(efresh::EfreshClient::new(language)),
        ),
    }
}

// Ensure a session, run `$call`, and on `SessionExpired` invalidate, log in
// again and run it once more.
macro_rules! with_session {
    ($self:ident, $call:expr) => {{
        $self.session.ensure_authenticated().await?;
        match $call.await {
            Err(Error::SessionExpired) => {
                tracing::info!(site = %$self.site(), "session expired, re-authenticating");
                $self.session.invalidate();
                $self.session.ensure_authenticated().await?;
                $call.await
            }
            other => other,
        }
    }};
}

/// One site's session manager and client.
pub struct Storefront {
    session: SessionManager,
    client: Box<dyn SiteClient>,
}

impl Storefront {
    /// Assemble from parts.
    pub fn new(session: SessionManager, client: Box<dyn SiteClient>) -> Self {
        Self { session, client }
    }

    /// Build from configuration over `transport` and load any saved session.
    pub fn with_transport(config: &SiteConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let http = HttpSession::new(transport, &config.base_url)?;
        let mut store = SessionStore::new(&config.session_file);
        if let Some(path) = &config.cookie_file {
            store = store.with_manual_cookie_file(path);
        }
        let (flow, client) = site_parts(config.site, config.language);
        let mut session = SessionManager::new(
            http,
            store,
            flow,
            config.credentials.clone(),
            config.zone.clone(),
        );
        if session.load_session() {
            tracing::info!(site = %config.site, "using saved session");
        }
        Ok(Self::new(session, client))
    }

    /// Build from configuration with the real HTTP client.
    pub fn from_config(config: &SiteConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(config.language.accept_language())?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Which site.
    pub fn site(&self) -> SiteKind {
        self.client.kind()
    }

    /// Session manager.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Session manager, mutably.
    pub fn session_mut(&mut self) -> &mut SessionManager {
        &mut self.session
    }

    /// Session snapshot.
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Log in with explicit credentials, falling back to the configured
    /// ones field by field.
    pub async fn login(&mut self, email: Option<String>, password: Option<String>) -> Result<SessionStatus> {
        let credentials = Credentials::resolve(self.site(), email, password, self.session.credentials())?;
        self.session.login(&credentials).await?;
        Ok(self.status())
    }

    /// Log out and forget the saved session.
    pub async fn logout(&mut self) -> Result<()> {
        self.session.logout().await
    }

    /// Search the catalog. Does not require a login.
    pub async fn search(&mut self, query: &str) -> Result<Vec<Product>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::InvalidParams("query must not be empty".into()));
        }
        match self.client.search(&mut self.session, query).await {
            Err(Error::SessionExpired) => {
                self.session.invalidate();
                if let Err(e) = self.session.ensure_authenticated().await {
                    tracing::debug!(site = %self.site(), error = %e, "searching without a session");
                }
                self.client.search(&mut self.session, query).await
            }
            other => other,
        }
    }

    /// Add to the cart and confirm the product is there afterwards.
    pub async fn add_to_cart(&mut self, product_id: &str, quantity: u32) -> Result<AddToCartResult> {
        let product_id = validate_product_id(product_id)?;
        validate_quantity(quantity)?;

        let outcome = with_session!(self, self.client.add_to_cart(&mut self.session, product_id, quantity))?;
        let cart = with_session!(self, self.client.get_cart(&mut self.session))?;

        let Some(item) = cart.find(product_id) else {
            tracing::warn!(site = %self.site(), product_id, "added product missing from cart");
            return Err(Error::OperationFailed(format!(
                "{} accepted the request but product {} is not in the cart",
                self.site(),
                product_id
            )));
        };
        let cart_quantity = item.quantity;
        tracing::info!(site = %self.site(), product_id, quantity, cart_quantity, "added to cart");

        Ok(AddToCartResult {
            product_id: product_id.to_string(),
            quantity,
            cart_quantity,
            selected_slot: outcome.selected_slot,
            cart,
        })
    }

    /// Remove a product from the cart and return the cart afterwards.
    pub async fn remove_from_cart(&mut self, product_id: &str) -> Result<Cart> {
        let product_id = validate_product_id(product_id)?;
        with_session!(self, self.client.remove_from_cart(&mut self.session, product_id))?;
        let cart = with_session!(self, self.client.get_cart(&mut self.session))?;
        if cart.find(product_id).is_some() {
            return Err(Error::OperationFailed(format!(
                "product {} is still in the cart",
                product_id
            )));
        }
        Ok(cart)
    }

    /// Change a cart line's quantity and return the cart afterwards.
    pub async fn update_cart_item(&mut self, product_id: &str, quantity: u32) -> Result<Cart> {
        let product_id = validate_product_id(product_id)?;
        validate_quantity(quantity)?;
        with_session!(self, self.client.update_cart_item(&mut self.session, product_id, quantity))?;
        with_session!(self, self.client.get_cart(&mut self.session))
    }

    /// Current cart.
    pub async fn get_cart(&mut self) -> Result<Cart> {
        with_session!(self, self.client.get_cart(&mut self.session))
    }

    /// Orders, active only unless `include_history`. With `include_items`,
    /// orders listed without lines are filled from their details; a failed
    /// lookup leaves that order as listed.
    pub async fn get_orders(
        &mut self,
        include_history: bool,
        include_items: bool,
    ) -> Result<Vec<Order>> {
        let mut orders =
            with_session!(self, self.client.get_orders(&mut self.session, include_history))?;
        if include_items {
            for order in orders.iter_mut().filter(|o| o.items.is_empty()) {
                match with_session!(self, self.client.get_order_details(&mut self.session, &order.id)) {
                    Ok(details) => order.items = details.items,
                    Err(e) if e.is_site_failure() => {
                        tracing::warn!(order = %order.id, error = %e, "could not fetch order lines");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(orders)
    }

    /// One order with its lines.
    pub async fn get_order_details(&mut self, order_id: &str) -> Result<Order> {
        let order_id = order_id.trim();
        if order_id.is_empty() {
            return Err(Error::InvalidParams("order_id must not be empty".into()));
        }
        with_session!(self, self.client.get_order_details(&mut self.session, order_id))
    }
}

fn validate_product_id(product_id: &str) -> Result<&str> {
    let product_id = product_id.trim();
    if product_id.is_empty() {
        return Err(Error::InvalidParams("product_id must not be empty".into()));
    }
    Ok(product_id)
}

fn validate_quantity(quantity: u32) -> Result<()> {
    if quantity == 0 {
        return Err(Error::InvalidParams("quantity must be at least 1".into()));
    }
    Ok(())
}
