//! Mobile Sync Server
//!
//! Offline-first synchronization between an authoritative SQLite store and
//! intermittently connected mobile devices: pull changes since a cursor,
//! push batches of local mutations, and resolve version conflicts.

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod events;
pub mod identity;
pub mod routes;
pub mod state;
pub mod sync;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/health", get(routes::health::health_check))
        .nest("/api/v1/sync", routes::sync::router())
        .nest("/api/v1/entities", routes::entities::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
