//! HTTP surface (spec §6): an axum `Router` over [`AppState`], with a
//! governor rate limit on the public payment endpoint and request tracing on
//! everything else, the same layering shape the retrieval pack's axum
//! services use.

pub mod handlers;
pub mod state;

use std::net::SocketAddr;
use std::time::Duration;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub use state::{AppState, SharedState};

pub fn build_router(state: SharedState) -> Router {
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(20)
            .burst_size(40)
            .finish()
            .expect("static governor config is valid"),
    );

    let pay_routes = Router::new()
        .route("/pay", post(handlers::post_pay))
        .layer(GovernorLayer::new(governor_config));

    Router::new()
        .route("/", get(handlers::index))
        .route("/metrics", get(handlers::metrics))
        .route(
            "/proposal",
            post(handlers::post_proposal).get(handlers::get_proposal),
        )
        .route("/check-payment", get(handlers::check_payment))
        .route("/track/transfer", get(handlers::get_track_transfer))
        .route("/track/transaction", get(handlers::get_track_transaction))
        .route(
            "/refund",
            post(handlers::post_refund).get(handlers::get_refund),
        )
        .merge(pay_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(35))),
        )
        .with_state(state)
}

/// Serve `router` on a TCP socket (spec §6 `serve=tcp`).
pub async fn serve_tcp(router: Router, addr: SocketAddr) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Serve `router` on a Unix domain socket (spec §6 `serve=unix`).
#[cfg(unix)]
pub async fn serve_unix(router: Router, path: &std::path::Path, mode: Option<u32>) -> eyre::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = tokio::net::UnixListener::bind(path)?;
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    tracing::info!(path = %path.display(), "HTTP server listening on unix socket");
    axum::serve(listener, router).await?;
    Ok(())
}
