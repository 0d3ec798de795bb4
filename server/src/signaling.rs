//! Signaling relay
//!
//! Forwards offer / answer / ICE candidate messages between the two
//! participants of a call session. Payloads are opaque and never parsed.
//! Messages for a recipient with no live subscription are dropped.

use crate::{
    error::{AppError, Result},
    models::{CallSession, CallStatus, SignalingMessage},
    subscriptions::{SubscriberMap, Subscription},
};

/// A recipient's inbox for one call session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalKey {
    pub user_id: String,
    pub call_session_id: String,
}

pub type SignalSubscription = Subscription<SignalKey, SignalingMessage>;

pub struct SignalingRelay {
    routes: SubscriberMap<SignalKey, SignalingMessage>,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self {
            routes: SubscriberMap::new(),
        }
    }

    /// Deliver to every live subscription of the recipient in this session.
    /// Returns the number of subscriptions reached.
    pub fn send(&self, message: SignalingMessage) -> usize {
        let key = SignalKey {
            user_id: message.to_user_id.clone(),
            call_session_id: message.call_session_id.clone(),
        };
        let signal_type = message.signal_type;

        let delivered = self.routes.publish(&key, message);
        if delivered == 0 {
            tracing::debug!(
                "Dropped {:?} for {} in session {}: no subscriber",
                signal_type,
                key.user_id,
                key.call_session_id
            );
        }
        delivered
    }

    pub fn subscribe(&self, user_id: &str, call_session_id: &str) -> SignalSubscription {
        self.routes.subscribe(SignalKey {
            user_id: user_id.to_string(),
            call_session_id: call_session_id.to_string(),
        })
    }
}

impl Default for SignalingRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that `sender` may relay `message` within `session`.
pub fn authorize_signal(
    session: &CallSession,
    sender: &str,
    message: &SignalingMessage,
    max_bytes: usize,
) -> Result<()> {
    if message.from_user_id != sender {
        return Err(AppError::Forbidden);
    }
    if message.call_session_id != session.id {
        return Err(AppError::BadRequest("Signal addressed to another session".to_string()));
    }
    if session.partner_of(sender) != Some(message.to_user_id.as_str()) {
        return Err(AppError::Forbidden);
    }
    if session.status == CallStatus::Ended {
        return Err(AppError::BadRequest(format!("Call session {} has ended", session.id)));
    }
    if message.data.len() > max_bytes {
        return Err(AppError::BadRequest(format!(
            "Signal payload exceeds {} bytes",
            max_bytes
        )));
    }
    Ok(())
}
