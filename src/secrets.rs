//! Process-wide secret resolution.
//!
//! The token codec's HMAC secret is read once at startup and never rotated
//! within a process. A missing secret is startup-fatal — there is no
//! fallback, demo, or generated value. Unlike a credential resolver that
//! checks a keychain or environment for several per-backend patterns, this
//! core has exactly one secret with exactly one source.

use crate::error::{ConsentError, Result};

const SECRET_KEY_ENV: &str = "SECRET_KEY";

/// Read `SECRET_KEY` from the process environment.
///
/// # Errors
///
/// Returns [`ConsentError::Config`] if `SECRET_KEY` is unset or empty.
pub fn load_secret_key() -> Result<Vec<u8>> {
    let value = std::env::var(SECRET_KEY_ENV)
        .map_err(|_| ConsentError::Config(format!("{SECRET_KEY_ENV} is required and was not set")))?;

    if value.is_empty() {
        return Err(ConsentError::Config(format!("{SECRET_KEY_ENV} must not be empty")));
    }

    Ok(value.into_bytes())
}
