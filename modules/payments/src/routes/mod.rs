//! HTTP boundary of the payments core

pub mod health;
pub mod webhooks;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::services::WebhookIngestor;
use crate::store::PaymentStore;

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<WebhookIngestor>,
    pub store: Arc<dyn PaymentStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/webhooks/payments/{provider}", post(webhooks::receive_webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}
