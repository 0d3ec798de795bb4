//! Call session handlers

use axum::{
    extract::{Path, State},
    Json,
};
use crate::{
    error::{AppError, Result},
    models::*,
    AppState,
};

use super::AuthUser;

pub async fn get_session(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<CallSession>> {
    let session = state.registry.get(&session_id).await?;
    if !session.is_participant(&auth.user_id) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(session))
}

/// Move a session forward; `ended` must carry an end reason
pub async fn update_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(session_id): Path<String>,
    Json(req): Json<UpdateCallStatusRequest>,
) -> Result<Json<CallSession>> {
    let update = match (req.status, req.end_reason) {
        (CallStatus::Connecting, None) => StatusUpdate::Connecting,
        (CallStatus::Connected, None) => StatusUpdate::Connected,
        (CallStatus::Ended, Some(reason)) => StatusUpdate::Ended(reason),
        (CallStatus::Ended, None) => {
            return Err(AppError::BadRequest("end_reason is required when ending a call".to_string()));
        }
        (CallStatus::Waiting, _) => {
            return Err(AppError::BadRequest("A call cannot return to waiting".to_string()));
        }
        (_, Some(_)) => {
            return Err(AppError::BadRequest("end_reason is only valid when ending a call".to_string()));
        }
    };

    let session = state
        .registry
        .update_status_as(&auth.user_id, &session_id, update)
        .await?;

    Ok(Json(session))
}
