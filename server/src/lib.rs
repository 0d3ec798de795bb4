//! DuoCall Server - coordination service for random one-to-one calls
//!
//! This server handles:
//! - Anonymous guest identities
//! - Matching waiting strangers by call type and gender preference
//! - Call session lifecycle tracking
//! - WebRTC signaling relay between matched peers
//! - ICE server distribution (STUN + time-limited TURN)

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod matching;
pub mod models;
pub mod registry;
pub mod signaling;
pub mod storage;
pub mod subscriptions;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::matching::MatchingCoordinator;
use crate::registry::CallSessionRegistry;
use crate::signaling::SignalingRelay;
use crate::storage::Storage;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub registry: Arc<CallSessionRegistry>,
    pub matching: Arc<MatchingCoordinator>,
    pub relay: Arc<SignalingRelay>,
}

impl AppState {
    /// Wire the services together over one storage handle.
    pub fn new(config: Arc<Config>, storage: Arc<Storage>) -> Self {
        let registry = Arc::new(CallSessionRegistry::new(Arc::clone(&storage)));
        let matching = Arc::new(MatchingCoordinator::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            config.matching.max_claim_attempts,
            config.matching.stale_request_minutes,
        ));

        Self {
            config,
            storage,
            registry,
            matching,
            relay: Arc::new(SignalingRelay::new()),
        }
    }

    /// One cleanup pass: stale requests, stale sessions, expired guests.
    pub async fn run_cleanup(&self) -> error::Result<()> {
        let requests = self.matching.cleanup_old_requests().await?;
        let sessions = self
            .registry
            .cleanup_stale_sessions(self.config.matching.stale_session_minutes)
            .await?;
        let guests = self.storage.cleanup_expired_guest_sessions().await?;

        if requests > 0 || sessions > 0 || guests > 0 {
            tracing::info!(
                "Cleanup: cancelled {} requests, ended {} sessions, removed {} guest sessions",
                requests,
                sessions,
                guests
            );
        }
        Ok(())
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))

        // Guest identity
        .route("/api/v1/auth/guest", post(handlers::auth::guest_login))

        // Matching
        .route("/api/v1/matching", post(handlers::matching::start_matching))
        .route(
            "/api/v1/matching/:request_id",
            get(handlers::matching::get_request).delete(handlers::matching::cancel_matching),
        )

        // Call sessions
        .route("/api/v1/calls/:session_id", get(handlers::calls::get_session))
        .route("/api/v1/calls/:session_id/status", post(handlers::calls::update_status))

        // ICE servers
        .route("/api/v1/ice/servers", get(handlers::ice::get_ice_servers))

        // WebSocket for match notifications and signaling
        .route("/ws", get(handlers::websocket::websocket_handler))

        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
