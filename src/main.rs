//! Allocator HTTP entrypoint.
//!
//! Launches an Axum-based server exposing the compact admission interface:
//!
//! - `POST /compact` – validate, co-sign, and record a compact
//! - `GET /compact/{chainId}/{claimHash}` – look up an admitted compact
//! - `GET /compacts` – list the authenticated sponsor's compacts
//! - `GET /health` – liveness probe
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the bind address
//! - `DATABASE_PATH`, `INDEXER_URL`, `PRIVATE_KEY` configure the pipeline
//!   unless a JSON config file overrides them

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;

use compact_allocator::config::Config;
use compact_allocator::handlers;
use compact_allocator::indexer::HttpIndexer;
use compact_allocator::service::Allocator;
use compact_allocator::sig_down::SigDown;
use compact_allocator::signer::DigestSigner;
use compact_allocator::storage::Database;
use compact_allocator::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let telemetry = Telemetry::new(env!("CARGO_PKG_NAME")).register();

    let config = Config::load()?;
    let signer = config.signer()?;
    let thresholds = config.thresholds()?;
    let database = Arc::new(Database::open(config.database())?);
    let indexer = HttpIndexer::new(config.indexer_url().clone());

    tracing::info!(
        allocator = %signer.signer_address(),
        database = %config.database().display(),
        indexer = %config.indexer_url(),
        "Allocator configured"
    );

    let allocator = Allocator::new(database, indexer, signer, thresholds);
    let axum_state = Arc::new(allocator);

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(axum_state))
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let sig_down = SigDown::try_new()?;
    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    Ok(())
}
