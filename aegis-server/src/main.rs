//! Aegis Server - REST API for WebAuthn and passkey ceremonies
//!
//! Exposes aegis-core ceremonies via HTTP endpoints:
//! - POST /api/secondfactor/webauthn/credential/register/{begin,finish}
//! - POST /api/secondfactor/webauthn/assertion/{begin,finish}
//! - POST /api/firstfactor/passkey/{begin,finish}
//! - GET|PUT|DELETE credential management

use std::net::SocketAddr;
use std::time::Duration;

use aegis_server::{create_router_with_state, AppState, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aegis_server=info,aegis_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let state = AppState::from_config(&config).await?;

    // Expired browser sessions
    let sessions = state.sessions.clone();
    let purge_every = Duration::from_secs(config.session_purge_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            let purged = sessions.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, remaining = sessions.session_count(), "Purged expired sessions");
            }
        }
    });

    let app = create_router_with_state(state, &config);

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        address = %addr,
        rp_name = %config.webauthn.display_name,
        passkey_login = config.policy.passkey_login_enabled,
        "Aegis server listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Gracefully shutdown");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
