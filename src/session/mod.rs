//! Session lifecycle: the in-memory record, its on-disk mirror, and the
//! manager that keeps an authenticated session available.

mod manager;
mod store;

use serde::{Deserialize, Deserializer, Serialize};

pub use manager::{AuthStrategy, LoginFlow, LoginOutcome, SessionManager, StrategyOutcome};
pub use store::SessionStore;

pub use crate::transport::CookieJar;

/// Cookies plus authentication state for one site.
///
/// Unknown fields are ignored and every field has a default, so files
/// written by older versions or edited by hand still load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Cookie name → value.
    #[serde(default)]
    pub cookies: CookieJar,
    /// Set by a successful login or cookie import.
    #[serde(default, alias = "is_authenticated")]
    pub authenticated: bool,
    /// Account email.
    #[serde(default, alias = "user_email", deserialize_with = "null_as_empty")]
    pub email: String,
    /// Last anti-forgery token seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
    /// Delivery zone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl SessionRecord {
    /// Whether any of `names` is in the jar.
    pub fn has_any_cookie(&self, names: &[&str]) -> bool {
        names.iter().any(|name| {
            self.cookies
                .get(*name)
                .is_some_and(|value| !value.is_empty())
        })
    }

    /// Reset to the unauthenticated state, keeping only the zone.
    pub fn clear(&mut self) {
        let zone = self.zone.take();
        *self = SessionRecord {
            zone,
            ..SessionRecord::default()
        };
    }
}
