//! club_edge server - edge proxy for the club data service
//!
//! Accepts JSON envelopes `{endpoint, method?, body?, headers?}`, attaches the
//! server-held key and forwards them to `DATA_SERVICE_URL`.
//!
//! Usage:
//!   DATA_SERVICE_URL=https://<project>.example.co DATA_SERVICE_KEY=... cargo run --bin club_edge
//!   curl -X POST localhost:11111/ -d '{"endpoint":"/rest/v1/events?select=*"}'

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use club_edge::config::{load_dotenv, ProxyConfig};
use club_edge::logging;
use club_edge::proxy::{create_router, ProxyState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let config = ProxyConfig::parse();
    let _log_guard = logging::init(&config.logging, "info");
    config.validate()?;

    let app = create_router(ProxyState::new(
        config.service_url.clone(),
        config.service_key.clone(),
    ));

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!(bind = %config.bind, upstream = %config.service_url, "edge proxy listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;

    Ok(())
}
