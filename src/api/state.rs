//! Shared application state handed to every axum handler, grounded on the
//! `Arc<AppState>`-via-`State` extractor pattern used across the retrieval
//! pack's axum services.

use std::sync::Arc;

use crate::auditors::AuditorTrustSet;
use crate::config::Config;
use crate::exchange::ExchangeLiaison;
use crate::instance_registry::InstanceRegistry;

pub struct AppState {
    pub pool: sqlx::PgPool,
    pub config: Config,
    pub registry: InstanceRegistry,
    pub auditors: AuditorTrustSet,
    pub liaison: ExchangeLiaison,
}

pub type SharedState = Arc<AppState>;
