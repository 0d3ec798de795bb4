//! ICE server list for WebRTC

use axum::{extract::State, Json};
use crate::{
    crypto,
    error::Result,
    models::{IceServer, IceServersResponse},
    AppState,
};

use super::AuthUser;

/// STUN servers plus time-limited TURN credentials when a relay is configured
pub async fn get_ice_servers(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<IceServersResponse>> {
    let ice = &state.config.ice;
    let mut ice_servers = Vec::new();

    if !ice.stun_urls.is_empty() {
        ice_servers.push(IceServer {
            urls: ice.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }

    let mut ttl = 0;
    if let Some(turn) = &ice.turn {
        let (username, credential) = crypto::generate_turn_credentials(
            &format!("{}-{}", turn.username, auth.user_id),
            &turn.secret,
            turn.ttl_seconds,
        );
        ice_servers.push(IceServer {
            urls: turn.urls.clone(),
            username: Some(username),
            credential: Some(credential),
        });
        ttl = turn.ttl_seconds;
    }

    Ok(Json(IceServersResponse { ice_servers, ttl }))
}
