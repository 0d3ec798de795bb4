//! Matching handlers

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

/// Queue the caller and pair them if a compatible stranger is waiting
pub async fn start_matching(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<StartMatchingRequest>,
) -> Result<Json<MatchOutcome>> {
    let outcome = state.matching.start_matching(&auth.user_id, &req).await?;
    Ok(Json(outcome))
}

pub async fn get_request(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(request_id): Path<String>,
) -> Result<Json<MatchingRequest>> {
    let request = state.matching.get_request(&request_id).await?;
    if request.user_id != auth.user_id {
        return Err(AppError::Forbidden);
    }
    Ok(Json(request))
}

/// Cancel a waiting request; a matched or cancelled request is returned unchanged
pub async fn cancel_matching(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(request_id): Path<String>,
) -> Result<Json<MatchingRequest>> {
    let request = state.matching.get_request(&request_id).await?;
    if request.user_id != auth.user_id {
        return Err(AppError::Forbidden);
    }

    let request = state.matching.cancel_matching(&request_id).await?;
    Ok(Json(request))
}
