//! Site selection, credentials and on-disk locations.
//!
//! Credentials come from the process environment (`<SITE>_EMAIL`,
//! `<SITE>_PASSWORD`, optional `<SITE>_ZIPCODE`) and are read once when a
//! [`SiteConfig`] is built. Tool-call parameters may override them per call.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The supported storefronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SiteKind {
    /// sklavenitis.gr supermarket.
    Sklavenitis,
    /// skroutz.gr marketplace.
    Skroutz,
    /// e-fresh.gr grocery delivery.
    Efresh,
}

impl SiteKind {
    /// Lowercase identifier, used for tool prefixes and file names.
    pub fn slug(self) -> &'static str {
        match self {
            SiteKind::Sklavenitis => "sklavenitis",
            SiteKind::Skroutz => "skroutz",
            SiteKind::Efresh => "efresh",
        }
    }

    /// Human-readable site name.
    pub fn display_name(self) -> &'static str {
        match self {
            SiteKind::Sklavenitis => "Sklavenitis",
            SiteKind::Skroutz => "Skroutz",
            SiteKind::Efresh => "E-Fresh",
        }
    }

    /// Public site root.
    pub fn base_url(self) -> &'static str {
        match self {
            SiteKind::Sklavenitis => "https://www.sklavenitis.gr",
            SiteKind::Skroutz => "https://www.skroutz.gr",
            SiteKind::Efresh => "https://www.e-fresh.gr",
        }
    }

    /// Environment variable name for the given suffix, e.g. `SKROUTZ_EMAIL`.
    pub fn env_var(self, suffix: &str) -> String {
        format!("{}_{}", self.slug().to_uppercase(), suffix)
    }
}

impl fmt::Display for SiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Interface language of sites that localize their paths and API bodies.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Greek.
    #[default]
    El,
    /// English.
    En,
}

impl Language {
    /// Path segment and API `lang` value.
    pub fn as_str(self) -> &'static str {
        match self {
            Language::El => "el",
            Language::En => "en",
        }
    }

    /// `Accept-Language` header preferring this language.
    pub fn accept_language(self) -> &'static str {
        match self {
            Language::El => "el-GR,el;q=0.9,en;q=0.8",
            Language::En => "en-US,en;q=0.9,el;q=0.8",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account email.
    pub email: String,
    /// Account password.
    pub password: String,
    /// Delivery zone (zipcode or hub id), if any.
    pub zone: Option<String>,
}

impl Credentials {
    /// Create credentials without a zone.
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            zone: None,
        }
    }

    /// Attach a delivery zone.
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Read `<SITE>_EMAIL` / `<SITE>_PASSWORD` / `<SITE>_ZIPCODE` through
    /// `lookup`. Returns `None` unless both email and password are present
    /// and non-empty.
    pub fn from_lookup<F>(site: SiteKind, lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |suffix: &str| lookup(&site.env_var(suffix)).filter(|v| !v.trim().is_empty());
        let email = non_empty("EMAIL")?;
        let password = non_empty("PASSWORD")?;
        Some(Self {
            email,
            password,
            zone: non_empty("ZIPCODE"),
        })
    }

    /// Read credentials from the process environment.
    pub fn from_env(site: SiteKind) -> Option<Self> {
        Self::from_lookup(site, |key| std::env::var(key).ok())
    }

    /// Merge explicit values over `fallback`, field by field.
    pub fn resolve(
        site: SiteKind,
        email: Option<String>,
        password: Option<String>,
        fallback: Option<&Credentials>,
    ) -> Result<Self> {
        let email = email
            .filter(|e| !e.is_empty())
            .or_else(|| fallback.map(|c| c.email.clone()))
            .ok_or(Error::CredentialsMissing(site))?;
        let password = password
            .filter(|p| !p.is_empty())
            .or_else(|| fallback.map(|c| c.password.clone()))
            .ok_or(Error::CredentialsMissing(site))?;
        Ok(Self {
            email,
            password,
            zone: fallback.and_then(|c| c.zone.clone()),
        })
    }
}

// Keep the password out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("zone", &self.zone)
            .finish()
    }
}

/// Everything needed to stand up one site's storefront.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    /// Which site.
    pub site: SiteKind,
    /// Base URL; overridable for tests and proxies.
    pub base_url: String,
    /// Persisted session file.
    pub session_file: PathBuf,
    /// Manually exported cookie file.
    pub cookie_file: Option<PathBuf>,
    /// Credentials from the environment.
    pub credentials: Option<Credentials>,
    /// Zone from the environment, kept even when credentials are absent.
    pub zone: Option<String>,
    /// Interface language (E-Fresh only).
    pub language: Language,
}

impl SiteConfig {
    /// Defaults for `site`: files under the home directory, credentials from
    /// the environment.
    pub fn from_env(site: SiteKind) -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Internal("could not determine home directory".into()))?;
        let credentials = Credentials::from_env(site);
        let zone = std::env::var(site.env_var("ZIPCODE"))
            .ok()
            .filter(|z| !z.trim().is_empty());
        Ok(Self {
            site,
            base_url: site.base_url().to_string(),
            session_file: home.join(format!(".{}_session.json", site.slug())),
            cookie_file: Some(home.join(format!(".{}_cookies.json", site.slug()))),
            credentials,
            zone,
            language: Language::default(),
        })
    }

    /// Explicit configuration, mostly for tests.
    pub fn new(site: SiteKind, base_url: impl Into<String>, session_file: PathBuf) -> Self {
        Self {
            site,
            base_url: base_url.into(),
            session_file,
            cookie_file: None,
            credentials: None,
            zone: None,
            language: Language::default(),
        }
    }

    /// Set the manual cookie file.
    pub fn with_cookie_file(mut self, path: PathBuf) -> Self {
        self.cookie_file = Some(path);
        self
    }

    /// Set credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        if self.zone.is_none() {
            self.zone = credentials.zone.clone();
        }
        self.credentials = Some(credentials);
        self
    }

    /// Set the delivery zone.
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }
}
