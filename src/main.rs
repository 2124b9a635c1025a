//! Hushh Consent & Scope Authorization Core
//!
//! Binds the HTTP surface, wires the Approval Coordinator's collaborators
//! together, and serves until Ctrl+C or SIGTERM.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use hushh_consent_core::cli::Cli;
use hushh_consent_core::config::Config;
use hushh_consent_core::coordinator::{Coordinator, DeveloperInfo, StaticDeveloperRegistry};
use hushh_consent_core::http::{build_router, AppState};
use hushh_consent_core::ledger::InMemoryLedger;
use hushh_consent_core::notify::NotificationBus;
use hushh_consent_core::rate_limit::RouteLimiter;
use hushh_consent_core::revocation::{FileRevocationStore, RevocationIndex};
use hushh_consent_core::secrets::load_secret_key;
use hushh_consent_core::setup_tracing;
use hushh_consent_core::token::TokenCodec;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let secret = match load_secret_key() {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load secret key: {e}");
            return ExitCode::FAILURE;
        }
    };

    let developers: HashMap<String, DeveloperInfo> = config
        .developers
        .iter()
        .map(|d| {
            (
                d.token.clone(),
                DeveloperInfo {
                    name: d.name.clone(),
                    approved_scopes: d.approved_scopes.clone(),
                },
            )
        })
        .collect();

    let ledger = Arc::new(InMemoryLedger::new());
    let codec = Arc::new(TokenCodec::new(secret));
    let registry = Arc::new(StaticDeveloperRegistry::new(developers));

    let store_path = config
        .revocation
        .store_path
        .clone()
        .map(Into::into)
        .unwrap_or_else(FileRevocationStore::default_path);
    let revocation = Arc::new(RevocationIndex::new_with_store(Box::new(FileRevocationStore::new(store_path))));

    let bus = Arc::new(NotificationBus::new());

    let coordinator = Arc::new(
        Coordinator::new(ledger, registry, codec, revocation)
            .with_bus(Arc::clone(&bus))
            .with_denial_cooldown_s(config.approval.denial_cooldown_seconds)
            .with_default_token_ttl_ms(config.approval.token_ttl.as_millis() as i64),
    );

    let state = Arc::new(AppState {
        coordinator,
        bus,
        limiter: Arc::new(RouteLimiter::new()),
        issue_token_ttl_ms: config.approval.token_ttl.as_millis() as i64,
        consent_timeout_s: config.approval.consent_timeout_seconds,
        frontend_url: config.frontend_url.clone(),
    });

    let app = build_router(state).into_make_service_with_connect_info::<std::net::SocketAddr>();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %addr,
        developers = config.developers.len(),
        "Starting Hushh Consent Core"
    );

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Waits for Ctrl+C or, on unix, SIGTERM — whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
