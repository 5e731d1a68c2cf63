use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::models::SystemHealthRecord;
use crate::services::{HealthMonitor, JobScheduler, JobState};

#[derive(Clone)]
pub struct HealthState {
    pub monitor: Arc<HealthMonitor>,
    pub scheduler: Arc<JobScheduler>,
}

#[derive(Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub services: Vec<SystemHealthRecord>,
    pub jobs: Vec<JobState>,
}

pub async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    match state.monitor.snapshot().await {
        Ok(services) => {
            let healthy = !services.iter().any(|s| s.status.is_unhealthy());
            let report = HealthReport {
                healthy,
                services,
                jobs: state.scheduler.job_states(),
            };
            let code = if healthy {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (code, Json(report)).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "healthy": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}
