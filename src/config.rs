//! Configuration management.
//!
//! Layered `figment` providers: a config file (Toml) overridden by
//! environment variables.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{ConsentError, Result};

const ENV_PREFIX: &str = "HUSHH_CONSENT_";

/// Top-level configuration for the consent core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Approval-flow timing configuration.
    pub approval: ApprovalConfig,
    /// Revocation persistence configuration.
    pub revocation: RevocationConfig,
    /// Registered external developers/agents and the scopes each may
    /// request. The registry itself is left as an external collaborator;
    /// this is the minimal config-loaded reference implementation needed
    /// to exercise the coordinator end to end.
    pub developers: Vec<DeveloperEntry>,
    /// Self-referential URL used in error responses that point callers back
    /// to a human-facing surface (`FRONTEND_URL`).
    pub frontend_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            approval: ApprovalConfig::default(),
            revocation: RevocationConfig::default(),
            developers: Vec::new(),
            frontend_url: None,
        }
    }
}

/// One entry in the developer registry: a bearer token mapped to a name and
/// the scopes it's approved to request. `approved_scopes` containing `"*"`
/// approves every scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperEntry {
    /// Bearer token the developer/agent presents as `developer_token`.
    pub token: String,
    /// Human-readable name, used in audit events.
    pub name: String,
    /// Scopes this developer may request.
    pub approved_scopes: Vec<String>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Graceful shutdown timeout.
    #[serde(with = "humantime_secs")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Approval-flow timing, all configurable per the "Environment
/// configuration" row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// How long a subscriber waits for a decision before the Notification
    /// Bus emits `consent_timeout`. Default 120s.
    pub consent_timeout_seconds: i64,
    /// Cooldown after a denial before the same scope may be requested
    /// again. Default 300s (5 minutes).
    pub denial_cooldown_seconds: i64,
    /// TTL applied to minted tokens. Default 7 days.
    #[serde(with = "humantime_secs")]
    pub token_ttl: Duration,
    /// Disables any demo auto-grant path. Must default to `true`; the core
    /// has no such path to disable, but the flag is kept so deployment
    /// configuration mirrors the source system's gate exactly.
    pub production_mode: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            consent_timeout_seconds: 120,
            denial_cooldown_seconds: 300,
            token_ttl: Duration::from_secs(7 * 24 * 3_600),
            production_mode: true,
        }
    }
}

/// Revocation durability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Path to the durable revocation store. Defaults to
    /// [`crate::revocation::FileRevocationStore::default_path`].
    pub store_path: Option<String>,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self { store_path: None }
    }
}

impl Config {
    /// Load configuration from an optional Toml file, overridden by
    /// `HUSHH_CONSENT_`-prefixed environment variables (double underscore
    /// `__` as the nesting separator, e.g. `HUSHH_CONSENT_SERVER__PORT`).
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is supplied but does not exist, or if the
    /// merged configuration fails to deserialize.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(ConsentError::Config(format!("config file not found: {}", p.display())));
            }
            figment = figment.merge(Toml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract().map_err(|e| ConsentError::Config(e.to_string()))
    }
}

/// Duration serialized/deserialized as whole seconds — simplified to the
/// one unit this core's durations are ever expressed in.
mod humantime_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_contract() {
        let config = Config::default();
        assert_eq!(config.approval.consent_timeout_seconds, 120);
        assert!(config.approval.production_mode);
    }

    #[test]
    fn load_with_missing_file_errors() {
        let result = Config::load(Some(Path::new("/nonexistent/hushh-consent.toml")));
        assert!(matches!(result, Err(ConsentError::Config(_))));
    }

    #[test]
    fn load_with_no_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.server.port, 8080);
    }
}
