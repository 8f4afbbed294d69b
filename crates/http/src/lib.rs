//! HTTP surface for subscription management.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod error;
pub mod handlers;
mod server;

pub use error::Error;
pub use handlers::USER_ID_HEADER;
pub use server::HttpServer;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{any, get, post};
use herald_coordinator::SubscriptionManagement;
use tower_http::cors::CorsLayer;

use handlers::{
    broadcast_handler, health_handler, list_handler, publish_handler, subscribe_handler,
    unsubscribe_handler,
};

/// Builds the API router over a subscription manager.
pub fn router<SM>(subscriptions: SM) -> Router
where
    SM: SubscriptionManagement,
{
    Router::new()
        .route(
            "/subscription/{topic}",
            post(subscribe_handler::<SM>).delete(unsubscribe_handler::<SM>),
        )
        .route("/subscription", get(list_handler::<SM>))
        .route("/publish/{topic}", post(publish_handler::<SM>))
        .route("/broadcast", post(broadcast_handler::<SM>))
        .route("/health", get(health_handler))
        .fallback(any(|| async { (StatusCode::NOT_FOUND, "") }))
        .layer(CorsLayer::very_permissive())
        .with_state(subscriptions)
}
