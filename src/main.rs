//! mystatusd - MyStatus presence daemon.
//!
//! Wires the transport gateway, account store, presence handler, and web
//! front end together and runs until the event stream ends.

use mystatusd::config::Config;
use mystatusd::db::Database;
use mystatusd::handlers::PresenceHandler;
use mystatusd::http::{self, AppState};
use mystatusd::metrics;
use mystatusd::registration::RegistrationMessenger;
use mystatusd::transport::{Transport, bridge};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(
        gateway = %config.transport.gateway_addr,
        site = %config.site.bind,
        "Starting mystatusd"
    );

    metrics::init();

    // Initialize database
    let db = Database::new(&config.database.path).await?;

    // Connect the protocol gateway bridge
    let (transport, events) = bridge::connect(config.transport.gateway_addr);
    let transport: Arc<dyn Transport> = Arc::new(transport);

    let messenger = Arc::new(RegistrationMessenger::new(
        db.clone(),
        Arc::clone(&transport),
        config.site.clone(),
    ));

    let handler = Arc::new(PresenceHandler::new(
        db.clone(),
        Arc::clone(&transport),
        Arc::clone(&messenger),
    ));

    // Web front end
    let state = AppState {
        db,
        site: config.site.clone(),
        transport: Arc::clone(&transport),
        messenger,
    };
    let site_bind = config.site.bind;
    tokio::spawn(async move {
        http::run_http_server(site_bind, state).await;
    });

    // Liveness no-op keeping the gateway session alive
    {
        let transport = Arc::clone(&transport);
        let period = Duration::from_secs(config.transport.keepalive_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it so a fresh
            // connection is not pinged before the gateway settles.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = transport.keepalive().await {
                    warn!(error = %e, "Keepalive send failed");
                }
            }
        });
    }
    info!("Keepalive task started");

    // Drive the presence pipeline until the gateway stream closes
    handler.run(events).await;

    Ok(())
}
