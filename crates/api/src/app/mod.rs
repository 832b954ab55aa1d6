//! Application wiring (axum router + service construction).
//!
//! - `services.rs`: infrastructure wiring (log, router, consumers, query)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};

use billflow_infra::config::Config;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: Config) -> anyhow::Result<Router> {
    let services = Arc::new(services::build_services(config).await?);

    Ok(Router::new()
        .route("/health", get(routes::system::health))
        .route("/consumers", get(routes::system::consumers))
        .route("/dead-letters", get(routes::system::dead_letters))
        .nest("/bills", routes::bills::router())
        .layer(Extension(services)))
}
