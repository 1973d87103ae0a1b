mod auth;
mod config;
mod middleware;

mod db;
mod directory;
mod error;
mod finance;
mod models;
mod routes;
mod scheduling;
mod store;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use crate::{
    config::{Config, StoreBackend},
    directory::PgDirectory,
    finance::PgRevenueSink,
    middleware::auth_context::PgSessionResolver,
    models::AppState,
    scheduling::service::AppointmentService,
    store::{AppointmentStore, MemoryAppointmentStore, PgAppointmentStore},
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url, cfg.db_max_connections).await?;
    if cfg.run_migrations {
        db::migrate(&pool).await?;
    }

    let store: Arc<dyn AppointmentStore> = match cfg.store_backend {
        StoreBackend::Postgres => Arc::new(PgAppointmentStore::new(pool.clone())),
        StoreBackend::Memory => {
            tracing::warn!("appointments are held in memory and lost on restart");
            Arc::new(MemoryAppointmentStore::new())
        }
    };

    let appointments = AppointmentService::new(
        store,
        Arc::new(PgDirectory::new(pool.clone())),
        Arc::new(PgRevenueSink::new(pool.clone())),
        cfg.clinic_offset,
    );

    let state = AppState {
        appointments: Arc::new(appointments),
        sessions: Arc::new(PgSessionResolver::new(pool)),
    };

    // browser clients on another origin need the OPTIONS preflight answered
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!(
        backend = ?cfg.store_backend,
        clinic_offset = %cfg.clinic_offset,
        "Listening on http://{}",
        cfg.bind_addr
    );
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
