//! Data models for DuoCall
//!
//! Wire types mirror the coordination server's JSON; the connection and
//! call event types are client-local.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Matching
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredGender {
    Anyone,
    Men,
    Women,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Video,
    Voice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingStatus {
    Waiting,
    Matched,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Joiner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMatchingRequest {
    pub gender: Gender,
    pub preferred_gender: PreferredGender,
    pub is_premium: bool,
    pub call_type: CallType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingRequest {
    pub id: String,
    pub user_id: String,
    pub user_gender: Gender,
    pub preferred_gender: PreferredGender,
    pub call_type: CallType,
    pub is_premium: bool,
    pub status: MatchingStatus,
    pub matched_with_user_id: Option<String>,
    pub call_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchOutcome {
    Waiting {
        request_id: String,
    },
    Matched {
        request_id: String,
        session_id: String,
        partner_id: String,
        role: CallRole,
    },
}

impl MatchOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            MatchOutcome::Waiting { request_id } | MatchOutcome::Matched { request_id, .. } => request_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchFound {
    pub request_id: String,
    pub session_id: String,
    pub partner_id: String,
    pub call_type: CallType,
    pub role: CallRole,
}

// ============================================================================
// Call Sessions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Waiting,
    Connecting,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserEnded,
    Timeout,
    PeerDisconnected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub id: String,
    pub initiator_id: String,
    pub receiver_id: Option<String>,
    pub call_type: CallType,
    pub status: CallStatus,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateCallStatusRequest {
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

// ============================================================================
// Signaling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub data: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub call_session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsClientMessage {
    #[serde(rename = "authenticate")]
    Authenticate { token: String },

    #[serde(rename = "join_call")]
    JoinCall { call_session_id: String },

    #[serde(rename = "leave_call")]
    LeaveCall { call_session_id: String },

    #[serde(rename = "signal")]
    Signal(SignalingMessage),

    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsServerMessage {
    #[serde(rename = "authenticated")]
    Authenticated { user_id: String },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "match_found")]
    MatchFound(MatchFound),

    #[serde(rename = "joined")]
    Joined { call_session_id: String },

    #[serde(rename = "signal")]
    Signal(SignalingMessage),

    #[serde(rename = "call_status")]
    CallStatus(CallSession),

    #[serde(rename = "pong")]
    Pong,
}

// ============================================================================
// Service API
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestIdentity {
    pub user_id: String,
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
    pub ttl: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting_video: i64,
    pub waiting_voice: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queue: QueueStats,
    pub online_users: usize,
}

// ============================================================================
// Peer Connection
// ============================================================================

/// Client-side lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Failed, _) => false,
            (_, Failed) => true,
            (New, Connecting) | (New, Connected) | (New, Disconnected) => true,
            (Connecting, Connected) | (Connecting, Disconnected) => true,
            (Connected, Disconnected) => true,
            (Disconnected, Connected) | (Disconnected, Disconnected) => true,
            _ => false,
        }
    }

    /// Checked transition; the error names both ends of a rejected move.
    pub fn transition_to(self, to: ConnectionState) -> crate::error::Result<ConnectionState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(crate::error::Error::InvalidTransition { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

/// Everything the peer manager needs to set up one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub session_id: String,
    pub local_user_id: String,
    pub remote_user_id: String,
    pub call_type: CallType,
    pub role: CallRole,
    pub ice_servers: Vec<IceServer>,
}
