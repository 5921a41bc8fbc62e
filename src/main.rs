mod api;
mod auditors;
mod bounded_cache;
mod config;
mod crypto;
mod db;
mod error;
mod exchange;
mod hash;
mod instance_registry;
mod metrics;
mod pay;
mod proposal;
mod track_transfer;
mod types;

use std::sync::Arc;

use api::{AppState, SharedState};
use auditors::AuditorTrustSet;
use config::{Config, ServeMode};
use exchange::ExchangeLiaison;
use instance_registry::InstanceRegistry;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("starting merchant backend");

    let config = Config::load()?;
    tracing::info!(
        currency = %config.merchant.currency,
        instances = config.instances.len(),
        exchanges = config.exchanges.len(),
        "configuration loaded"
    );

    let pool = db::create_pool(&config.database.url).await?;
    tracing::info!("database connected");

    db::run_migrations(&pool).await?;
    tracing::info!("database migrations complete");

    let registry = InstanceRegistry::load(&config)?;
    let auditors = AuditorTrustSet::load(&config);
    let liaison = ExchangeLiaison::startup(&config)?;

    metrics::UP.set(1.0);

    // Three independent shutdown fan-outs: the refresh loop, the HTTP
    // server, and (in a future revision) a background wire-transfer
    // sweeper, all triggered from the same signal.
    let (shutdown_tx, shutdown_rx_liaison) = tokio::sync::mpsc::channel::<()>(1);
    let (shutdown_tx2, mut shutdown_rx_http) = tokio::sync::mpsc::channel::<()>(1);

    let shutdown_tx_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx_signal.send(()).await;
        let _ = shutdown_tx2.send(()).await;
    });

    let state: SharedState = Arc::new(AppState {
        pool,
        config: config.clone(),
        registry,
        auditors,
        liaison,
    });

    let refresh_state = state.clone();
    let refresh_handle = tokio::spawn(async move {
        refresh_state.liaison.run_refresh_loop(shutdown_rx_liaison).await;
    });

    let router = api::build_router(state.clone());

    let serve_result = match config.merchant.serve {
        ServeMode::Tcp => {
            let bind_ip = config
                .merchant
                .bind_to
                .clone()
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let addr: std::net::SocketAddr = format!("{}:{}", bind_ip, config.merchant.port)
                .parse()
                .map_err(|e| eyre::eyre!("invalid bind address: {e}"))?;
            tokio::select! {
                result = api::serve_tcp(router, addr) => result,
                _ = shutdown_rx_http.recv() => Ok(()),
            }
        }
        ServeMode::Unix => {
            let path = config
                .merchant
                .unixpath
                .as_ref()
                .ok_or_else(|| eyre::eyre!("serve=unix requires unixpath"))?;
            #[cfg(unix)]
            {
                tokio::select! {
                    result = api::serve_unix(
                        router,
                        std::path::Path::new(path),
                        config.merchant.unixpath_mode,
                    ) => result,
                    _ = shutdown_rx_http.recv() => Ok(()),
                }
            }
            #[cfg(not(unix))]
            {
                return Err(eyre::eyre!("serve=unix is only supported on unix targets"));
            }
        }
    };

    if let Err(e) = serve_result {
        tracing::error!(error = %e, "HTTP server error");
    }
    let _ = refresh_handle.await;

    tracing::info!("merchant backend stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,taler_merchant_core=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
}
