pub mod health;

use axum::{routing::get, Router};

pub use health::HealthState;

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/health", get(health::health))
        .with_state(state)
}
