mod api;
mod audit;
mod config;
mod engine;
mod error;
mod geo;
mod models;
mod observability;
mod routing;
mod state;
mod store;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;
use crate::routing::OsrmRouteProvider;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    let config = config::Config::from_env()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);
    match config.log_format {
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Json => subscriber.json().init(),
    }

    let routes = Arc::new(OsrmRouteProvider::new(
        config.route_service_url.clone(),
        config.route_timeout(),
    )?);

    let (app_state, audit_rx) = state::AppState::new(&config, routes);
    let shared_state = Arc::new(app_state);

    tokio::spawn(audit::run_audit_writer(
        shared_state.audit_log.clone(),
        audit_rx,
    ));

    let reaper_state = shared_state.clone();
    let reap_every = config.session_reap_interval();
    tokio::spawn(async move { reaper_state.dispatcher.run_reaper(reap_every).await });

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| error::AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        route_service = %config.route_service_url,
        "http server started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| error::AppError::Internal(format!("server error: {err}")))?;

    shared_state.dispatcher.shutdown().await;
    tracing::info!("tracking sessions stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
