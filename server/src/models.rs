//! Data models for DuoCall Server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Matching Attributes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PreferredGender {
    Anyone,
    Men,
    Women,
}

impl PreferredGender {
    /// Whether a partner of `gender` satisfies this preference.
    pub fn accepts(self, gender: Gender) -> bool {
        match self {
            PreferredGender::Anyone => true,
            PreferredGender::Men => gender == Gender::Male,
            PreferredGender::Women => gender == Gender::Female,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CallType {
    Video,
    Voice,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Video => "video",
            CallType::Voice => "voice",
        }
    }
}

// ============================================================================
// Matching Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MatchingStatus {
    Waiting,
    Matched,
    Cancelled,
}

impl MatchingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MatchingStatus::Waiting)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
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

impl MatchingRequest {
    /// Symmetric compatibility: equal call type and each side accepts the other.
    pub fn is_compatible_with(&self, other: &MatchingRequest) -> bool {
        self.user_id != other.user_id
            && self.call_type == other.call_type
            && self.preferred_gender.accepts(other.user_gender)
            && other.preferred_gender.accepts(self.user_gender)
    }
}

/// Which side of the call a participant plays during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    /// Creates the SDP offer.
    Initiator,
    /// Answers the offer.
    Joiner,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchFound {
    pub request_id: String,
    pub session_id: String,
    pub partner_id: String,
    pub call_type: CallType,
    pub role: CallRole,
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
            MatchOutcome::Waiting { request_id } => request_id,
            MatchOutcome::Matched { request_id, .. } => request_id,
        }
    }
}

// ============================================================================
// Call Sessions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CallStatus {
    Waiting,
    Connecting,
    Connected,
    Ended,
}

impl CallStatus {
    pub const ALL: [CallStatus; 4] = [
        CallStatus::Waiting,
        CallStatus::Connecting,
        CallStatus::Connected,
        CallStatus::Ended,
    ];

    /// Position along `waiting -> connecting -> connected -> ended`.
    pub fn rank(&self) -> u8 {
        match self {
            CallStatus::Waiting => 0,
            CallStatus::Connecting => 1,
            CallStatus::Connected => 2,
            CallStatus::Ended => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Waiting => "waiting",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
        }
    }

    /// Statuses from which `self` may be entered.
    pub fn predecessors(&self) -> Vec<CallStatus> {
        CallStatus::ALL
            .into_iter()
            .filter(|s| s.rank() < self.rank())
            .collect()
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EndReason {
    UserEnded,
    Timeout,
    PeerDisconnected,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
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

impl CallSession {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.initiator_id == user_id || self.receiver_id.as_deref() == Some(user_id)
    }

    /// The other participant, if `user_id` is one of them.
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if self.initiator_id == user_id {
            self.receiver_id.as_deref()
        } else if self.receiver_id.as_deref() == Some(user_id) {
            Some(&self.initiator_id)
        } else {
            None
        }
    }
}

/// A requested status change. `Ended` cannot be expressed without a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Connecting,
    Connected,
    Ended(EndReason),
}

impl StatusUpdate {
    pub fn status(&self) -> CallStatus {
        match self {
            StatusUpdate::Connecting => CallStatus::Connecting,
            StatusUpdate::Connected => CallStatus::Connected,
            StatusUpdate::Ended(_) => CallStatus::Ended,
        }
    }
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
    /// Opaque SDP or ICE payload, never inspected by the relay.
    pub data: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub call_session_id: String,
}

// ============================================================================
// Guest Identity
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GuestSession {
    pub token_hash: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_valid: bool,
}

// ============================================================================
// WebSocket Models
// ============================================================================

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

impl WsServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        WsServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// API Request/Response Models
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct GuestLoginResponse {
    pub user_id: String,
    pub token: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartMatchingRequest {
    pub gender: Gender,
    pub preferred_gender: PreferredGender,
    #[serde(default)]
    pub is_premium: bool,
    pub call_type: CallType,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateCallStatusRequest {
    pub status: CallStatus,
    pub end_reason: Option<EndReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
    pub ttl: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStats {
    pub waiting_video: i64,
    pub waiting_voice: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub queue: QueueStats,
    pub online_users: usize,
}

#[derive(Debug, Serialize)]
pub struct ServerStats {
    pub waiting_requests: i64,
    pub matched_requests: i64,
    pub cancelled_requests: i64,
    pub active_calls: i64,
    pub ended_calls: i64,
}
