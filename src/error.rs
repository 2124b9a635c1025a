//! Error types for the consent core.

use thiserror::Error;

/// Result type alias for the consent core.
pub type Result<T> = std::result::Result<T, ConsentError>;

/// Errors surfaced by the consent core.
///
/// Each variant corresponds to one row of the error taxonomy: a semantic
/// kind, an HTTP status it maps to, and (for token/scope failures) a reason
/// string that is safe to return to the caller verbatim.
///
/// The taxonomy's cooldown/pending/timeout rows are expected outcomes of
/// `request_consent`, not failures — they're modeled as
/// [`crate::coordinator::ConsentOutcome`] variants returned in `Ok`, not as
/// `ConsentError`, so callers don't have to distinguish "this request didn't
/// fail, it's just not resolved yet" from an `Err` branch.
#[derive(Error, Debug)]
pub enum ConsentError {
    /// Token string didn't parse: missing delimiters, bad base64, or wrong
    /// field count. A wrong prefix is its own variant, not this one — see
    /// [`Self::InvalidTokenPrefix`].
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Token string didn't start with the expected `HCT:` prefix.
    #[error("Invalid token prefix")]
    InvalidTokenPrefix,

    /// HMAC signature didn't match the recomputed value.
    #[error("Invalid signature")]
    InvalidSignature,

    /// `now_ms > expires_at`.
    #[error("Token expired")]
    TokenExpired,

    /// Token identifier found in the revocation index.
    #[error("Token has been revoked")]
    TokenRevoked,

    /// `satisfies(granted, requested)` returned false.
    #[error("Scope mismatch: token has '{granted}', but '{requested}' required")]
    ScopeMismatch {
        /// The scope string carried by the token.
        granted: String,
        /// The scope required by the caller.
        requested: String,
    },

    /// `context.user_id != token.user_id` — identity spoofing defense.
    #[error("User id mismatch: context is for '{context_user}', token is for '{token_user}'")]
    UserIdMismatch {
        /// The user id bound to the active context.
        context_user: String,
        /// The user id carried by the token.
        token_user: String,
    },

    /// The calling developer/agent is not in the developer registry.
    #[error("Unregistered developer: {0}")]
    UnregisteredDeveloper(String),

    /// The developer is registered but not approved for the requested scope.
    #[error("Developer '{developer}' is not approved for scope '{scope}'")]
    DeveloperNotApproved {
        /// Developer/agent identifier.
        developer: String,
        /// Scope that was requested.
        scope: String,
    },

    /// The scope string itself doesn't parse to a recognized shape.
    #[error("Invalid scope string: {0}")]
    InvalidScope(String),

    /// The ledger or notification bus could not be reached. Never a
    /// substitute for a real grant/deny outcome.
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// The notification bus failed to deliver or subscribe.
    #[error("Notification bus error: {0}")]
    NotificationBus(String),

    /// Configuration error at startup (e.g. missing `SECRET_KEY`).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error with no more specific classification.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConsentError {
    /// The HTTP status code this error maps to, per the error taxonomy table.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MalformedToken(_)
            | Self::InvalidTokenPrefix
            | Self::InvalidSignature
            | Self::TokenExpired
            | Self::TokenRevoked
            | Self::UnregisteredDeveloper(_) => 401,
            Self::ScopeMismatch { .. } => 401,
            Self::UserIdMismatch { .. } | Self::DeveloperNotApproved { .. } => 403,
            Self::InvalidScope(_) => 400,
            Self::LedgerUnavailable(_) | Self::NotificationBus(_) | Self::Internal(_) => 500,
            Self::Config(_) => 500,
        }
    }

    /// The stable machine-readable reason string, matching the taxonomy's
    /// "surfaces as" column where a status-with-reason is expected.
    #[must_use]
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
