//! Keeps an authenticated session available to site clients.
//!
//! The fallback chain is an ordered list of [`AuthStrategy`] values. Each
//! strategy can be attempted on its own through
//! [`SessionManager::attempt`], which is what [`SessionManager::ensure_authenticated`]
//! walks.

use std::fmt;

use super::{CookieJar, SessionRecord, SessionStore};
use crate::config::{Credentials, SiteKind};
use crate::error::{Error, LoginFailure, Result};
use crate::models::SessionStatus;
use crate::transport::{HttpRequest, HttpResponse, HttpSession};

/// Result of a site login handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The logged-in marker was found.
    Authenticated {
        /// Token to reuse for later form posts, if the site has one.
        csrf_token: Option<String>,
    },
    /// The handshake did not produce a session.
    Failed(LoginFailure),
}

/// Site-specific login handshake.
#[async_trait::async_trait]
pub trait LoginFlow: Send + Sync {
    /// Which site this flow logs into.
    fn site(&self) -> SiteKind;

    /// Cookies of which at least one must be present for a session to count.
    fn session_cookies(&self) -> &'static [&'static str];

    /// Cookie encoding the delivery zone, if the site uses one.
    fn zone_cookie(&self, _zone: &str) -> Option<(String, String)> {
        None
    }

    /// Run the handshake with `jar`. Network problems are errors; a site that
    /// says no is an `Ok(LoginOutcome::Failed(..))`.
    async fn login(
        &self,
        http: &HttpSession,
        jar: &mut CookieJar,
        credentials: &Credentials,
    ) -> Result<LoginOutcome>;

    /// Request that ends the session server-side.
    fn logout_request(&self) -> Option<HttpRequest> {
        None
    }
}

/// One way of obtaining a session, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Reuse the persisted session file.
    PersistedSession,
    /// Import a manually exported cookie file.
    ManualCookies,
    /// Run the login handshake with configured credentials.
    CredentialLogin,
}

impl AuthStrategy {
    /// The chain walked by `ensure_authenticated`.
    pub const CHAIN: [AuthStrategy; 3] = [
        AuthStrategy::PersistedSession,
        AuthStrategy::ManualCookies,
        AuthStrategy::CredentialLogin,
    ];

    /// Short name for logs and messages.
    pub fn name(self) -> &'static str {
        match self {
            AuthStrategy::PersistedSession => "persisted session",
            AuthStrategy::ManualCookies => "manual cookie file",
            AuthStrategy::CredentialLogin => "credential login",
        }
    }
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a single strategy attempt did.
#[derive(Debug)]
pub enum StrategyOutcome {
    /// The session is now authenticated.
    Authenticated,
    /// The strategy did not apply.
    Skipped(String),
    /// The strategy applied and failed.
    Failed(Error),
}

/// Owns one site's [`SessionRecord`] and is its only writer.
pub struct SessionManager {
    http: HttpSession,
    store: SessionStore,
    flow: Box<dyn LoginFlow>,
    credentials: Option<Credentials>,
    record: SessionRecord,
    skip_cached: bool,
}

impl SessionManager {
    /// New manager with an empty, unauthenticated record.
    pub fn new(
        http: HttpSession,
        store: SessionStore,
        flow: Box<dyn LoginFlow>,
        credentials: Option<Credentials>,
        zone: Option<String>,
    ) -> Self {
        let zone = zone.or_else(|| credentials.as_ref().and_then(|c| c.zone.clone()));
        let mut manager = Self {
            http,
            store,
            flow,
            credentials,
            record: SessionRecord {
                zone,
                ..SessionRecord::default()
            },
            skip_cached: false,
        };
        manager.apply_zone();
        manager
    }

    /// Site this manager serves.
    pub fn site(&self) -> SiteKind {
        self.flow.site()
    }

    /// Current record.
    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// HTTP session bound to the site root.
    pub fn http(&self) -> &HttpSession {
        &self.http
    }

    /// Credentials used for automatic login.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Whether the in-memory record is authenticated. No network call.
    pub fn is_authenticated(&self) -> bool {
        self.record.authenticated && self.record.has_any_cookie(self.flow.session_cookies())
    }

    /// Try the persisted file, then the manual cookie file. Never fails;
    /// returns whether a session was loaded.
    pub fn load_session(&mut self) -> bool {
        for strategy in [AuthStrategy::PersistedSession, AuthStrategy::ManualCookies] {
            let outcome = match strategy {
                AuthStrategy::PersistedSession => self.load_persisted(),
                _ => self.import_manual_cookies(),
            };
            match outcome {
                StrategyOutcome::Authenticated => return true,
                StrategyOutcome::Skipped(reason) => {
                    tracing::debug!(site = %self.site(), %strategy, %reason, "strategy skipped");
                }
                StrategyOutcome::Failed(e) => {
                    tracing::warn!(site = %self.site(), %strategy, error = %e, "strategy failed");
                }
            }
        }
        false
    }

    /// Attempt a single strategy.
    pub async fn attempt(&mut self, strategy: AuthStrategy) -> StrategyOutcome {
        match strategy {
            AuthStrategy::PersistedSession => self.load_persisted(),
            AuthStrategy::ManualCookies => self.import_manual_cookies(),
            AuthStrategy::CredentialLogin => self.login_with_configured().await,
        }
    }

    fn load_persisted(&mut self) -> StrategyOutcome {
        if self.skip_cached {
            return StrategyOutcome::Skipped("cached cookies were discarded".into());
        }
        let Some(mut record) = self.store.load() else {
            return StrategyOutcome::Skipped(format!(
                "no usable session file at {}",
                self.store.path().display()
            ));
        };
        if !record.has_any_cookie(self.flow.session_cookies()) {
            return StrategyOutcome::Skipped("session file has no session cookies".into());
        }

        record.authenticated = true;
        if self.record.zone.is_some() {
            record.zone = self.record.zone.clone();
        }
        self.record = record;
        self.apply_zone();
        tracing::info!(
            site = %self.site(),
            path = %self.store.path().display(),
            "loaded persisted session"
        );
        StrategyOutcome::Authenticated
    }

    fn import_manual_cookies(&mut self) -> StrategyOutcome {
        if self.skip_cached {
            return StrategyOutcome::Skipped("cached cookies were discarded".into());
        }
        let Some(cookies) = self.store.load_manual() else {
            return StrategyOutcome::Skipped("no manual cookie file".into());
        };
        let record = SessionRecord {
            cookies,
            authenticated: true,
            email: self
                .credentials
                .as_ref()
                .map(|c| c.email.clone())
                .unwrap_or_default(),
            csrf_token: None,
            zone: self.record.zone.clone(),
        };
        if !record.has_any_cookie(self.flow.session_cookies()) {
            return StrategyOutcome::Skipped(format!(
                "cookie file lacks any of {:?}",
                self.flow.session_cookies()
            ));
        }

        self.record = record;
        self.apply_zone();
        if let Err(e) = self.store.save(&self.record) {
            tracing::warn!(site = %self.site(), error = %e, "could not persist imported cookies");
        }
        tracing::info!(
            site = %self.site(),
            cookies = self.record.cookies.len(),
            "imported manual cookie file"
        );
        StrategyOutcome::Authenticated
    }

    async fn login_with_configured(&mut self) -> StrategyOutcome {
        let Some(credentials) = self.credentials.clone() else {
            return StrategyOutcome::Skipped(format!(
                "no credentials ({} / {})",
                self.site().env_var("EMAIL"),
                self.site().env_var("PASSWORD")
            ));
        };
        match self.login(&credentials).await {
            Ok(()) => StrategyOutcome::Authenticated,
            Err(e) => StrategyOutcome::Failed(e),
        }
    }

    /// Run the login handshake once. On success the record is replaced and
    /// persisted; on failure it is left untouched.
    pub async fn login(&mut self, credentials: &Credentials) -> Result<()> {
        tracing::info!(site = %self.site(), email = %credentials.email, "logging in");

        let session_cookies = self.flow.session_cookies();
        let mut jar: CookieJar = self
            .record
            .cookies
            .iter()
            .filter(|(name, _)| !session_cookies.contains(&name.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let csrf_token = match self.flow.login(&self.http, &mut jar, credentials).await? {
            LoginOutcome::Authenticated { csrf_token } => csrf_token,
            LoginOutcome::Failed(reason) => {
                tracing::warn!(site = %self.site(), %reason, "login rejected");
                return Err(Error::LoginFailed { reason });
            }
        };

        let zone = self.record.zone.clone().or_else(|| credentials.zone.clone());
        let record = SessionRecord {
            cookies: jar,
            authenticated: true,
            email: credentials.email.clone(),
            csrf_token,
            zone,
        };
        if !record.has_any_cookie(session_cookies) {
            tracing::warn!(site = %self.site(), "login reported success without a session cookie");
            return Err(Error::LoginFailed {
                reason: LoginFailure::Unverified,
            });
        }

        self.record = record;
        self.apply_zone();
        self.skip_cached = false;
        if self.credentials.is_none() {
            self.credentials = Some(credentials.clone());
        }
        if let Err(e) = self.store.save(&self.record) {
            tracing::warn!(site = %self.site(), error = %e, "could not persist session");
        }
        tracing::info!(site = %self.site(), cookies = self.record.cookies.len(), "login successful");
        Ok(())
    }

    /// Make sure the record is authenticated, walking the strategy chain
    /// once if it is not.
    pub async fn ensure_authenticated(&mut self) -> Result<()> {
        if self.is_authenticated() {
            return Ok(());
        }

        let mut reasons = Vec::new();
        for strategy in AuthStrategy::CHAIN {
            match self.attempt(strategy).await {
                StrategyOutcome::Authenticated => {
                    tracing::debug!(site = %self.site(), %strategy, "authenticated");
                    return Ok(());
                }
                StrategyOutcome::Skipped(reason) => {
                    tracing::debug!(site = %self.site(), %strategy, %reason, "strategy skipped");
                    reasons.push(format!("{}: {}", strategy, reason));
                }
                StrategyOutcome::Failed(e @ Error::Network(_)) => return Err(e),
                StrategyOutcome::Failed(e) => {
                    tracing::warn!(site = %self.site(), %strategy, error = %e, "strategy failed");
                    reasons.push(format!("{}: {}", strategy, e));
                }
            }
        }

        let mut message = format!("not logged in to {} ({})", self.site(), reasons.join("; "));
        if let Some(path) = self.store.manual_path() {
            message.push_str(&format!(
                ". Log in through a browser and export the cookies to {}",
                path.display()
            ));
        }
        Err(Error::AuthenticationRequired(message))
    }

    /// End the session: best-effort server logout, then clear memory and
    /// disk.
    pub async fn logout(&mut self) -> Result<()> {
        if self.is_authenticated() {
            if let Some(request) = self.flow.logout_request() {
                if let Err(e) = self.http.send(&mut self.record.cookies, request).await {
                    tracing::debug!(site = %self.site(), error = %e, "logout request failed");
                }
            }
        }
        self.record.clear();
        self.apply_zone();
        self.skip_cached = true;
        self.store.clear()?;
        tracing::info!(site = %self.site(), "logged out");
        Ok(())
    }

    /// The site rejected the cookies: drop to unauthenticated and make the
    /// next `ensure_authenticated` go straight to credential login.
    pub fn invalidate(&mut self) {
        tracing::info!(site = %self.site(), "session rejected by site");
        let session_cookies = self.flow.session_cookies();
        self.record.authenticated = false;
        self.record
            .cookies
            .retain(|name, _| !session_cookies.contains(&name.as_str()));
        self.skip_cached = true;
    }

    /// Send a site request with the session's cookies. Cookies the site
    /// rotates are written back, and persisted while authenticated.
    pub async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let before = self.record.cookies.clone();
        let response = self.http.send(&mut self.record.cookies, request).await?;
        if self.record.cookies != before && self.is_authenticated() {
            if let Err(e) = self.store.save(&self.record) {
                tracing::warn!(site = %self.site(), error = %e, "could not persist rotated cookies");
            }
        }
        Ok(response)
    }

    /// Remember the latest anti-forgery token.
    pub fn set_csrf_token(&mut self, token: Option<String>) {
        if token.is_some() {
            self.record.csrf_token = token;
        }
    }

    /// Status snapshot.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            site: self.site().slug().to_string(),
            authenticated: self.is_authenticated(),
            email: self.record.email.clone(),
            cookie_count: self.record.cookies.len(),
            zone: self.record.zone.clone(),
            credentials_configured: self.credentials.is_some(),
        }
    }

    fn apply_zone(&mut self) {
        let Some(zone) = self.record.zone.as_deref() else {
            return;
        };
        if let Some((name, value)) = self.flow.zone_cookie(zone) {
            self.record.cookies.insert(name, value);
        }
    }
}
