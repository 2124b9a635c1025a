//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Hushh Consent & Scope Authorization Core
#[derive(Parser, Debug)]
#[command(name = "hushh-consent-core")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (Toml)
    #[arg(short, long, env = "HUSHH_CONSENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "HUSHH_CONSENT_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "HUSHH_CONSENT_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HUSHH_CONSENT_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "HUSHH_CONSENT_LOG_FORMAT")]
    pub log_format: Option<String>,
}
