//! Error types for DuoCall Core

use thiserror::Error;

use crate::media::MediaAccessError;
use crate::models::ConnectionState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Call cannot start: {}", .blockers.join("; "))]
    InitializationBlocked { blockers: Vec<String> },

    #[error("Matching failed: {0}")]
    MatchingFailed(String),

    #[error("Negotiation timed out")]
    NegotiationTimeout,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid connection transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("No active call")]
    NoActiveCall,

    #[error("Not connected to the service")]
    NotConnected,

    #[error("Server error {status} ({code}): {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Media error: {0}")]
    Media(#[from] MediaAccessError),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Message safe to show to the person on the call.
    pub fn user_message(&self) -> String {
        match self {
            Error::InitializationBlocked { blockers } => blockers.join(" "),
            Error::Media(e) => e.to_string(),
            Error::MatchingFailed(_) => "We couldn't find you a partner. Please try again.".to_string(),
            Error::NegotiationTimeout | Error::ConnectionFailed(_) => {
                "The connection to your partner could not be established.".to_string()
            }
            Error::CallInProgress => "You are already in a call.".to_string(),
            Error::NoActiveCall => "There is no call to end.".to_string(),
            Error::Server { status: 401, .. } | Error::NotConnected => {
                "Your session has expired. Please reconnect.".to_string()
            }
            _ => "Something went wrong with the connection. Please try again.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::WebRtc(e.to_string())
    }
}
