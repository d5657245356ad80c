//! Error types for the grocery MCP servers.

use thiserror::Error;

use crate::config::SiteKind;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a login handshake did not produce a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailure {
    /// The login page carried no anti-forgery token.
    MissingToken,
    /// A CAPTCHA or Cloudflare challenge was interposed.
    BotChallenge,
    /// The site rejected the email/password pair.
    InvalidCredentials,
    /// The handshake completed but no logged-in marker was found.
    Unverified,
}

impl std::fmt::Display for LoginFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            LoginFailure::MissingToken => "login page did not contain a CSRF token",
            LoginFailure::BotChallenge => {
                "the site answered with a bot challenge (CAPTCHA/Cloudflare)"
            }
            LoginFailure::InvalidCredentials => "the site rejected the email or password",
            LoginFailure::Unverified => "could not verify that the session is logged in",
        };
        f.write_str(text)
    }
}

/// Grocery MCP errors.
#[derive(Error, Debug)]
pub enum Error {
    /// No credentials in the environment or in the call.
    #[error("no credentials for {0}: set {email} and {password} or pass them to the login tool", email = .0.env_var("EMAIL"), password = .0.env_var("PASSWORD"))]
    CredentialsMissing(SiteKind),

    /// Login handshake failed.
    #[error("login failed: {reason}")]
    LoginFailed {
        /// Failure classification.
        reason: LoginFailure,
    },

    /// The site no longer accepts the session cookies.
    #[error("session expired: the site rejected the stored cookies")]
    SessionExpired,

    /// Connection-level failure; the call may be retried by the caller.
    #[error("network error: {0}")]
    Network(String),

    /// The site answered with something the parser does not understand.
    #[error("unrecognized site response: {0}")]
    UnrecognizedResponse(String),

    /// Operation denied because no session could be established.
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    /// The account has no delivery address or zone configured.
    #[error("delivery setup required: {0}")]
    DeliverySetupRequired(String),

    /// Non-success HTTP status from the site.
    #[error("{context} failed with HTTP {status}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// What was being attempted.
        context: String,
    },

    /// The site refused the operation.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// JSON-RPC protocol error.
    #[error("JSON-RPC error: {code} - {message}")]
    JsonRpc {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// Tool not found.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Invalid parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::JsonRpc { code, .. } => *code,
            Error::ToolNotFound(_) => -32601,  // Method not found
            Error::InvalidParams(_) => -32602, // Invalid params
            Error::Serialization(_) => -32700, // Parse error
            Error::Internal(_) => -32603,      // Internal error
            Error::CredentialsMissing(_) => -32000,
            Error::AuthenticationRequired(_) => -32001,
            Error::LoginFailed { .. } => -32002,
            Error::SessionExpired => -32003,
            Error::Network(_) => -32004,
            Error::UnrecognizedResponse(_) => -32005,
            Error::DeliverySetupRequired(_) => -32006,
            Error::HttpStatus { .. } => -32007,
            Error::OperationFailed(_) => -32008,
            Error::Io(_) => -32009,
        }
    }

    /// Whether this error comes from the site or the session rather than
    /// from a malformed request. Such errors are reported as tool results
    /// with `isError` set instead of JSON-RPC errors.
    pub fn is_site_failure(&self) -> bool {
        !matches!(
            self,
            Error::JsonRpc { .. }
                | Error::ToolNotFound(_)
                | Error::InvalidParams(_)
                | Error::Serialization(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

/// Standard JSON-RPC error codes.
pub mod codes {
    /// Invalid request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
}
