use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::{handlers::common::ApiResponse, AppState};

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub version: &'static str,
    pub timestamp: String,
    pub database: ComponentStatus,
    pub database_latency_ms: u64,
    pub payment_provider: &'static str,
}

/// Liveness plus a database ping. Answers 503 when the database is down.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let started = Instant::now();
    let db_up = crate::db::check_connection(&state.db).await.is_ok();
    let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let status = if db_up {
        ComponentStatus::Up
    } else {
        ComponentStatus::Down
    };
    let code = if db_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let report = HealthReport {
        status,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        database: status,
        database_latency_ms: latency,
        payment_provider: state.services.checkout.gateway().name(),
    };
    let mut body = ApiResponse::new(code, if db_up { "Healthy" } else { "Unhealthy" }, report);
    body.success = db_up;
    (code, Json(body))
}
