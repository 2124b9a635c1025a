//! Hushh Consent & Scope Authorization Core
//!
//! A standalone authorization core for scope-based human-in-the-loop
//! consent: a developer/agent requests access to a scope on a user's data,
//! the user approves or denies out-of-band, and everything downstream -
//! token issuance, revocation, and per-call context binding - is derived
//! from one append-only ledger.
//!
//! # Modules
//!
//! - [`scope`]: scope string parsing and the `satisfies` matching rules.
//! - [`token`]: signed, revocable consent tokens.
//! - [`ledger`]: the append-only event store every projection is computed from.
//! - [`coordinator`]: the two-step request/grant/deny state machine.
//! - [`revocation`]: the hard revocation index, independent of expiry.
//! - [`notify`]: push delivery of consent resolutions over SSE.
//! - [`context`]: the Context Gate a caller must pass through to act under a grant.
//! - [`http`]: the stable HTTP surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod ledger;
pub mod notify;
pub mod rate_limit;
pub mod revocation;
pub mod scope;
pub mod secrets;
pub mod token;

pub use error::{ConsentError, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Set up structured logging: an `EnvFilter` seeded from `level` (overridden
/// by `RUST_LOG` if set), with either plain-text or JSON formatting.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
