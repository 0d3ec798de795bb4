//! Guest identity handlers

use axum::{extract::State, Json};
use crate::{
    crypto,
    error::Result,
    models::GuestLoginResponse,
    AppState,
};

/// Issue a fresh anonymous identity and its session token
pub async fn guest_login(State(state): State<AppState>) -> Result<Json<GuestLoginResponse>> {
    let user_id = crypto::generate_guest_id()?;
    let token = crypto::generate_session_token()?;

    let expires_at = state
        .storage
        .create_guest_session(&user_id, &token, state.config.storage.guest_session_hours)
        .await?;

    tracing::info!("Guest session issued for {}", user_id);

    Ok(Json(GuestLoginResponse {
        user_id,
        token,
        expires_at: expires_at.timestamp(),
    }))
}
