//! # grocery-mcp
//!
//! MCP (Model Context Protocol) servers for Greek grocery and e-commerce
//! sites: Sklavenitis, Skroutz and E-Fresh.
//!
//! Each server process serves one site. It logs in with the account's
//! credentials, keeps the resulting cookies on disk and reuses them on the
//! next start, and logs in again on its own when the site drops the session.
//!
//! ## Available Tools
//!
//! Every tool is prefixed with the site slug, e.g. `skroutz_get_cart`:
//!
//! - `<site>_login`, `<site>_logout`, `<site>_session_status`
//! - `<site>_search_products`
//! - `<site>_add_to_cart`, `<site>_remove_from_cart`, `<site>_update_cart_quantity`, `<site>_get_cart`
//! - `<site>_get_orders`, `<site>_get_order_details`
//!
//! While logged in, `<site>://cart` and `<site>://orders` are also exposed
//! as resources.
//!
//! ## Usage with VS Code
//!
//! Add to your `.vscode/mcp.json`:
//!
//! ```json
//! {
//!   "servers": {
//!     "skroutz": {
//!       "command": "grocery-mcp",
//!       "args": ["--site", "skroutz"],
//!       "env": {
//!         "SKROUTZ_EMAIL": "you@example.com",
//!         "SKROUTZ_PASSWORD": "..."
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! ## Sessions
//!
//! Sessions are stored in `~/.<site>_session.json` with owner-only
//! permissions. If automatic login is blocked by a CAPTCHA, cookies exported
//! from a browser can be placed in `~/.<site>_cookies.json` instead.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
#[cfg(feature = "http")]
pub mod http_server;
pub mod models;
pub mod protocol;
pub mod server;
pub mod session;
pub mod sites;
pub mod tools;
pub mod transport;

pub use config::{Credentials, Language, SiteConfig, SiteKind};
pub use error::{Error, LoginFailure, Result};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, McpMessage};
pub use server::McpServer;
pub use session::{SessionManager, SessionRecord, SessionStore};
pub use sites::{SiteClient, Storefront};
pub use tools::{Tool, ToolContext, ToolRegistry};
pub use transport::{HttpRequest, HttpResponse, HttpSession, Transport};
