//! Health check handler

use axum::{extract::State, Json};
use crate::{error::Result, models::HealthResponse, AppState};

pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let queue = state.matching.queue_stats().await?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue,
        online_users: state.matching.online_users(),
    }))
}
