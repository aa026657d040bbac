mod health;
mod images;
mod metrics;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};
use health::healthcheck;
use images::upload_images;
use metrics::metrics_handler;

pub const IMAGES_ROUTE: &str = "/api/images";

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
        .route(IMAGES_ROUTE, post(upload_images))
}
