//! Call session registry
//!
//! Owns every `CallSession` mutation. Status only moves forward along
//! `waiting -> connecting -> connected -> ended`; storage applies each change
//! as a conditional update so concurrent writers cannot regress a record.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::*,
    storage::Storage,
    subscriptions::{SubscriberMap, Subscription},
};

/// Session change notifications, keyed by participant user id.
pub type SessionSubscription = Subscription<String, CallSession>;

const MAX_UPDATE_ATTEMPTS: usize = 3;

pub struct CallSessionRegistry {
    storage: Arc<Storage>,
    watchers: SubscriberMap<String, CallSession>,
}

impl CallSessionRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            watchers: SubscriberMap::new(),
        }
    }

    /// Session record for a fresh match: receiver attached, already `connecting`.
    pub fn matched_session(initiator_id: &str, receiver_id: &str, call_type: CallType) -> CallSession {
        let now = Utc::now();
        CallSession {
            id: Uuid::new_v4().to_string(),
            initiator_id: initiator_id.to_string(),
            receiver_id: Some(receiver_id.to_string()),
            call_type,
            status: CallStatus::Connecting,
            connected_at: None,
            ended_at: None,
            end_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Open a session with no receiver yet.
    pub async fn create(&self, initiator_id: &str, call_type: CallType) -> Result<CallSession> {
        let now = Utc::now();
        let session = CallSession {
            id: Uuid::new_v4().to_string(),
            initiator_id: initiator_id.to_string(),
            receiver_id: None,
            call_type,
            status: CallStatus::Waiting,
            connected_at: None,
            ended_at: None,
            end_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.storage.insert_call_session(&session).await?;
        tracing::debug!("Call session created: {} by {}", session.id, initiator_id);

        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<CallSession> {
        self.storage
            .get_call_session(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Call session {} not found", session_id)))
    }

    /// Set the receiver of a `waiting` session, moving it to `connecting`.
    pub async fn attach_receiver(&self, session_id: &str, receiver_id: &str) -> Result<CallSession> {
        if self.storage.attach_receiver(session_id, receiver_id).await? {
            let session = self.get(session_id).await?;
            tracing::info!("Receiver {} attached to session {}", receiver_id, session_id);
            self.announce(&session);
            return Ok(session);
        }

        let session = self.get(session_id).await?;
        if session.receiver_id.as_deref() == Some(receiver_id) {
            return Ok(session);
        }
        if session.receiver_id.is_some() {
            return Err(AppError::BadRequest(format!(
                "Call session {} already has a receiver",
                session_id
            )));
        }
        Err(AppError::InvalidTransition {
            from: session.status,
            to: CallStatus::Connecting,
        })
    }

    /// Apply a forward status change. Re-applying the current status is a no-op.
    ///
    /// `receiver_id` is required only to leave `waiting` for a live status
    /// (`connecting` or `connected`). A session that never got a receiver may
    /// still go straight to `ended`, and keeps `receiver_id` unset.
    pub async fn update_status(&self, session_id: &str, update: StatusUpdate) -> Result<CallSession> {
        let target = update.status();

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            if self.storage.update_call_status(session_id, update).await? {
                let session = self.get(session_id).await?;
                tracing::info!("Call session {} -> {}", session_id, target);
                self.announce(&session);
                return Ok(session);
            }

            let current = self.get(session_id).await?;
            if current.status == target {
                tracing::debug!("Call session {} already {}", session_id, target);
                return Ok(current);
            }

            let needs_receiver = target != CallStatus::Ended && current.receiver_id.is_none();
            if current.status.rank() > target.rank() || needs_receiver {
                return Err(AppError::InvalidTransition {
                    from: current.status,
                    to: target,
                });
            }
            // Lost a race with a concurrent forward update; re-evaluate.
        }

        let current = self.get(session_id).await?;
        Err(AppError::InvalidTransition {
            from: current.status,
            to: target,
        })
    }

    /// `update_status` restricted to the session's participants.
    pub async fn update_status_as(
        &self,
        user_id: &str,
        session_id: &str,
        update: StatusUpdate,
    ) -> Result<CallSession> {
        let session = self.get(session_id).await?;
        if !session.is_participant(user_id) {
            return Err(AppError::Forbidden);
        }
        self.update_status(session_id, update).await
    }

    /// Watch status changes of sessions `user_id` participates in.
    pub fn subscribe(&self, user_id: &str) -> SessionSubscription {
        self.watchers.subscribe(user_id.to_string())
    }

    /// Publish a session to its participants.
    pub fn announce(&self, session: &CallSession) {
        self.watchers.publish(&session.initiator_id, session.clone());
        if let Some(receiver) = &session.receiver_id {
            self.watchers.publish(receiver, session.clone());
        }
    }

    /// End sessions that never reached `connected` within `horizon_minutes`.
    pub async fn cleanup_stale_sessions(&self, horizon_minutes: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::minutes(horizon_minutes);
        let ended = self.storage.end_stale_sessions(cutoff).await?;

        for id in &ended {
            if let Some(session) = self.storage.get_call_session(id).await? {
                self.announce(&session);
            }
        }

        if !ended.is_empty() {
            tracing::info!("Ended {} stale call sessions", ended.len());
        }
        Ok(ended.len())
    }
}
