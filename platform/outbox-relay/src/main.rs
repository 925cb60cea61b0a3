mod config;
mod http;

use config::{BusType, Config};
use event_bus::dlq::PgDeadLetterSink;
use event_bus::outbox::PgOutboxStore;
use event_bus::relay::{Relay, RelayMetrics};
use event_bus::{EventBus, InMemoryBus, NatsBus};
use sqlx::postgres::PgPoolOptions;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    tracing::info!(bus_type = ?config.bus_type, "Configuration loaded");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection established");

    event_bus::MIGRATOR.run(&pool).await?;
    tracing::info!("Database migrations completed");

    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::Nats => {
            let nats_url = config.nats_url.as_deref().ok_or("NATS_URL is not set")?;
            tracing::info!("Connecting to NATS at {}", nats_url);
            let client = async_nats::connect(nats_url).await?;
            Arc::new(NatsBus::new(client))
        }
        BusType::InMemory => {
            // nothing outside this process can read what the relay publishes
            tracing::error!("BUS_TYPE=inmemory: outbox entries will be marked processed without reaching a broker");
            Arc::new(InMemoryBus::new())
        }
    };

    let registry = prometheus::Registry::new();
    let metrics = RelayMetrics::new(&registry)?;

    let mut relay = Relay::new(
        Arc::new(PgOutboxStore::new(pool.clone())),
        bus,
        config.relay.clone(),
        metrics,
    );
    if config.dead_letter_stalled {
        relay = relay.with_dead_letters(Arc::new(PgDeadLetterSink::new(pool.clone())));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { relay.run(shutdown).await })
    };

    let app = http::router(http::AppState {
        pool: pool.clone(),
        registry,
    });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Outbox relay listening on {}", addr);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // a dropped sender also means stop
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    relay_task.await?;
    pool.close().await;
    tracing::info!("Outbox relay shut down");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
