//! Matching coordinator
//!
//! Pairs waiting strangers by call type and mutual gender preference. The
//! earliest compatible waiting request wins. A pair is claimed in one storage
//! transaction together with its call session; a lost claim moves on to the
//! next candidate.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::*,
    registry::CallSessionRegistry,
    storage::{ClaimResult, Storage},
    subscriptions::{SubscriberMap, Subscription},
};

/// Match notifications for one user. Unsubscribes on drop.
pub type MatchSubscription = Subscription<String, MatchFound>;

pub struct MatchingCoordinator {
    storage: Arc<Storage>,
    registry: Arc<CallSessionRegistry>,
    notifier: SubscriberMap<String, MatchFound>,
    max_claim_attempts: usize,
    stale_request_minutes: i64,
}

impl MatchingCoordinator {
    pub fn new(
        storage: Arc<Storage>,
        registry: Arc<CallSessionRegistry>,
        max_claim_attempts: usize,
        stale_request_minutes: i64,
    ) -> Self {
        Self {
            storage,
            registry,
            notifier: SubscriberMap::new(),
            max_claim_attempts: max_claim_attempts.max(1),
            stale_request_minutes,
        }
    }

    /// Queue `user_id` and try to pair them immediately.
    ///
    /// The arriving user becomes the session initiator. When no partner is
    /// available the request stays `waiting` and the user is told through
    /// [`MatchingCoordinator::subscribe`] once a later arrival claims it.
    pub async fn start_matching(&self, user_id: &str, criteria: &StartMatchingRequest) -> Result<MatchOutcome> {
        let now = Utc::now();
        let own = MatchingRequest {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            user_gender: criteria.gender,
            preferred_gender: criteria.preferred_gender,
            call_type: criteria.call_type,
            is_premium: criteria.is_premium,
            status: MatchingStatus::Waiting,
            matched_with_user_id: None,
            call_session_id: None,
            created_at: now,
            updated_at: now,
        };
        let replaced = self.storage.requeue_matching_request(&own).await?;
        if replaced > 0 {
            tracing::info!("Replaced {} waiting request(s) of user {}", replaced, user_id);
        }

        tracing::debug!(
            "Matching request {} queued: user={}, call_type={}",
            own.id,
            user_id,
            own.call_type.as_str()
        );

        for attempt in 1..=self.max_claim_attempts {
            let Some(candidate) = self.storage.find_oldest_compatible(&own).await? else {
                return Ok(MatchOutcome::Waiting { request_id: own.id });
            };
            if !own.is_compatible_with(&candidate) {
                tracing::error!(
                    "Queue returned incompatible candidate {} for request {}",
                    candidate.id,
                    own.id
                );
                return Ok(MatchOutcome::Waiting { request_id: own.id });
            }

            let session = CallSessionRegistry::matched_session(&own.user_id, &candidate.user_id, own.call_type);

            match self.storage.claim_match(&own, &candidate, &session).await? {
                ClaimResult::Claimed => {
                    tracing::info!(
                        "Matched {} with {} in session {}",
                        own.user_id,
                        candidate.user_id,
                        session.id
                    );
                    self.notify_match(&own, &candidate, &session);
                    self.registry.announce(&session);

                    return Ok(MatchOutcome::Matched {
                        request_id: own.id,
                        session_id: session.id,
                        partner_id: candidate.user_id,
                        role: CallRole::Initiator,
                    });
                }
                ClaimResult::CandidateTaken => {
                    tracing::debug!(
                        "Candidate {} claimed concurrently (attempt {})",
                        candidate.id,
                        attempt
                    );
                }
                ClaimResult::OwnTaken => {
                    // A concurrent arrival claimed us first
                    return self.outcome_of(&own.id).await;
                }
            }
        }

        tracing::warn!(
            "Gave up claiming for request {} after {} attempts; left waiting",
            own.id,
            self.max_claim_attempts
        );
        Ok(MatchOutcome::Waiting { request_id: own.id })
    }

    /// `waiting -> cancelled`. Cancelling a matched or cancelled request is a
    /// no-op; the current record is returned either way. Never ends a call.
    pub async fn cancel_matching(&self, request_id: &str) -> Result<MatchingRequest> {
        let request = self.get_request(request_id).await?;

        if !request.status.is_terminal() && self.storage.cancel_waiting_request(request_id).await? {
            tracing::info!("Matching request {} cancelled", request_id);
            return self.get_request(request_id).await;
        }

        // Re-read: a concurrent claim may have won
        let current = self.get_request(request_id).await?;
        tracing::info!(
            "Cancel ignored for request {}: already {:?}",
            request_id,
            current.status
        );
        Ok(current)
    }

    pub async fn get_request(&self, request_id: &str) -> Result<MatchingRequest> {
        self.storage
            .get_matching_request(request_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Matching request {} not found", request_id)))
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            waiting_video: self.storage.count_waiting(CallType::Video).await?,
            waiting_voice: self.storage.count_waiting(CallType::Voice).await?,
        })
    }

    pub fn subscribe(&self, user_id: &str) -> MatchSubscription {
        self.notifier.subscribe(user_id.to_string())
    }

    /// Users currently listening for match notifications.
    pub fn online_users(&self) -> usize {
        self.notifier.key_count()
    }

    /// Cancel waiting requests older than the configured horizon.
    pub async fn cleanup_old_requests(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::minutes(self.stale_request_minutes);
        let cancelled = self.storage.cancel_stale_requests(cutoff).await?;
        if cancelled > 0 {
            tracing::info!("Cancelled {} stale matching requests", cancelled);
        }
        Ok(cancelled)
    }

    async fn outcome_of(&self, request_id: &str) -> Result<MatchOutcome> {
        let request = self.get_request(request_id).await?;

        match request.status {
            MatchingStatus::Waiting => Ok(MatchOutcome::Waiting {
                request_id: request.id,
            }),
            MatchingStatus::Matched => {
                let (Some(session_id), Some(partner_id)) = (request.call_session_id, request.matched_with_user_id)
                else {
                    return Err(AppError::MatchingFailed(format!(
                        "Request {} is matched without a session",
                        request.id
                    )));
                };
                let session = self.registry.get(&session_id).await?;
                let role = if session.initiator_id == request.user_id {
                    CallRole::Initiator
                } else {
                    CallRole::Joiner
                };
                Ok(MatchOutcome::Matched {
                    request_id: request.id,
                    session_id,
                    partner_id,
                    role,
                })
            }
            MatchingStatus::Cancelled => Err(AppError::MatchingFailed(format!(
                "Request {} was cancelled while matching",
                request.id
            ))),
        }
    }

    fn notify_match(&self, initiator: &MatchingRequest, joiner: &MatchingRequest, session: &CallSession) {
        self.notifier.publish(
            &initiator.user_id,
            MatchFound {
                request_id: initiator.id.clone(),
                session_id: session.id.clone(),
                partner_id: joiner.user_id.clone(),
                call_type: session.call_type,
                role: CallRole::Initiator,
            },
        );

        let delivered = self.notifier.publish(
            &joiner.user_id,
            MatchFound {
                request_id: joiner.id.clone(),
                session_id: session.id.clone(),
                partner_id: initiator.user_id.clone(),
                call_type: session.call_type,
                role: CallRole::Joiner,
            },
        );
        if delivered == 0 {
            tracing::debug!("User {} matched while not subscribed", joiner.user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fixture {
        storage: Arc<Storage>,
        registry: Arc<CallSessionRegistry>,
        matching: Arc<MatchingCoordinator>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(Storage::in_memory().await.unwrap());
        let registry = Arc::new(CallSessionRegistry::new(Arc::clone(&storage)));
        let matching = Arc::new(MatchingCoordinator::new(
            Arc::clone(&storage),
            Arc::clone(&registry),
            16,
            60,
        ));
        Fixture {
            storage,
            registry,
            matching,
        }
    }

    fn criteria(gender: Gender, preferred: PreferredGender, call_type: CallType) -> StartMatchingRequest {
        StartMatchingRequest {
            gender,
            preferred_gender: preferred,
            is_premium: false,
            call_type,
        }
    }

    #[tokio::test]
    async fn test_compatible_pair_creates_one_session() {
        let f = fixture().await;

        let first = f
            .matching
            .start_matching("alice", &criteria(Gender::Female, PreferredGender::Anyone, CallType::Video))
            .await
            .unwrap();
        assert!(matches!(first, MatchOutcome::Waiting { .. }));

        let second = f
            .matching
            .start_matching("bob", &criteria(Gender::Male, PreferredGender::Women, CallType::Video))
            .await
            .unwrap();

        let MatchOutcome::Matched {
            session_id,
            partner_id,
            role,
            ..
        } = second.clone()
        else {
            panic!("expected a match, got {:?}", second);
        };
        assert_eq!(partner_id, "alice");
        assert_eq!(role, CallRole::Initiator);

        let waiter = f.matching.get_request(first.request_id()).await.unwrap();
        let arrival = f.matching.get_request(second.request_id()).await.unwrap();
        assert_eq!(waiter.status, MatchingStatus::Matched);
        assert_eq!(arrival.status, MatchingStatus::Matched);
        assert_eq!(waiter.call_session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(arrival.call_session_id.as_deref(), Some(session_id.as_str()));
        assert_eq!(waiter.matched_with_user_id.as_deref(), Some("bob"));

        let session = f.registry.get(&session_id).await.unwrap();
        assert_eq!(session.initiator_id, "bob");
        assert_eq!(session.receiver_id.as_deref(), Some("alice"));
        assert_eq!(session.status, CallStatus::Connecting);

        let stats = f.storage.get_stats().await.unwrap();
        assert_eq!(stats.active_calls, 1);
        assert_eq!(stats.waiting_requests, 0);
    }

    #[tokio::test]
    async fn test_incompatible_pair_in_either_order() {
        for swap in [false, true] {
            let f = fixture().await;
            let a = ("m1", criteria(Gender::Male, PreferredGender::Men, CallType::Video));
            let b = ("f1", criteria(Gender::Female, PreferredGender::Anyone, CallType::Video));
            let (first, second) = if swap { (b, a) } else { (a, b) };

            let one = f.matching.start_matching(first.0, &first.1).await.unwrap();
            let two = f.matching.start_matching(second.0, &second.1).await.unwrap();
            assert!(matches!(one, MatchOutcome::Waiting { .. }));
            assert!(matches!(two, MatchOutcome::Waiting { .. }));
            assert_eq!(f.matching.queue_stats().await.unwrap().waiting_video, 2);
        }
    }

    #[tokio::test]
    async fn test_call_types_never_mix() {
        let f = fixture().await;
        f.matching
            .start_matching("a", &criteria(Gender::Other, PreferredGender::Anyone, CallType::Voice))
            .await
            .unwrap();
        let outcome = f
            .matching
            .start_matching("b", &criteria(Gender::Other, PreferredGender::Anyone, CallType::Video))
            .await
            .unwrap();
        assert!(matches!(outcome, MatchOutcome::Waiting { .. }));

        let stats = f.matching.queue_stats().await.unwrap();
        assert_eq!(stats, QueueStats { waiting_video: 1, waiting_voice: 1 });
    }

    #[tokio::test]
    async fn test_other_is_accepted_only_by_anyone() {
        let f = fixture().await;
        f.matching
            .start_matching("o", &criteria(Gender::Other, PreferredGender::Anyone, CallType::Voice))
            .await
            .unwrap();

        let picky = f
            .matching
            .start_matching("w", &criteria(Gender::Female, PreferredGender::Women, CallType::Voice))
            .await
            .unwrap();
        assert!(matches!(picky, MatchOutcome::Waiting { .. }));

        let open = f
            .matching
            .start_matching("x", &criteria(Gender::Male, PreferredGender::Anyone, CallType::Voice))
            .await
            .unwrap();
        match open {
            MatchOutcome::Matched { partner_id, .. } => assert_eq!(partner_id, "o"),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_earliest_waiter_wins() {
        let f = fixture().await;
        f.matching
            .start_matching("first", &criteria(Gender::Male, PreferredGender::Anyone, CallType::Video))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = f
            .matching
            .start_matching("second", &criteria(Gender::Female, PreferredGender::Women, CallType::Video))
            .await
            .unwrap();
        assert!(matches!(second, MatchOutcome::Waiting { .. }));

        let outcome = f
            .matching
            .start_matching("arrival", &criteria(Gender::Female, PreferredGender::Anyone, CallType::Video))
            .await
            .unwrap();
        match outcome {
            MatchOutcome::Matched { partner_id, .. } => assert_eq!(partner_id, "first"),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let f = fixture().await;
        let outcome = f
            .matching
            .start_matching("alice", &criteria(Gender::Female, PreferredGender::Anyone, CallType::Video))
            .await
            .unwrap();

        let first = f.matching.cancel_matching(outcome.request_id()).await.unwrap();
        let second = f.matching.cancel_matching(outcome.request_id()).await.unwrap();
        assert_eq!(first.status, MatchingStatus::Cancelled);
        assert_eq!(second.status, MatchingStatus::Cancelled);
        assert_eq!(first.updated_at, second.updated_at);

        // A cancelled request is never matched
        let later = f
            .matching
            .start_matching("bob", &criteria(Gender::Male, PreferredGender::Anyone, CallType::Video))
            .await
            .unwrap();
        assert!(matches!(later, MatchOutcome::Waiting { .. }));
    }

    #[tokio::test]
    async fn test_cancel_after_match_keeps_call() {
        let f = fixture().await;
        let any = criteria(Gender::Male, PreferredGender::Anyone, CallType::Voice);
        let waiting = f.matching.start_matching("a", &any).await.unwrap();
        let matched = f.matching.start_matching("b", &any).await.unwrap();
        let MatchOutcome::Matched { session_id, .. } = matched else {
            panic!("expected match");
        };

        let request = f.matching.cancel_matching(waiting.request_id()).await.unwrap();
        assert_eq!(request.status, MatchingStatus::Matched);
        assert_eq!(
            f.registry.get(&session_id).await.unwrap().status,
            CallStatus::Connecting
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_request() {
        let f = fixture().await;
        let err = f.matching.cancel_matching("nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restart_replaces_waiting_request() {
        let f = fixture().await;
        let any = criteria(Gender::Other, PreferredGender::Anyone, CallType::Video);
        let first = f.matching.start_matching("alice", &any).await.unwrap();
        let second = f.matching.start_matching("alice", &any).await.unwrap();

        // A user is never matched with their own request
        assert!(matches!(second, MatchOutcome::Waiting { .. }));
        let old = f.matching.get_request(first.request_id()).await.unwrap();
        assert_eq!(old.status, MatchingStatus::Cancelled);
        assert_eq!(f.matching.queue_stats().await.unwrap().waiting_video, 1);
    }

    #[tokio::test]
    async fn test_concurrent_restarts_leave_one_waiting_request() {
        let f = fixture().await;
        let any = criteria(Gender::Other, PreferredGender::Anyone, CallType::Voice);

        let (a, b, c) = tokio::join!(
            f.matching.start_matching("alice", &any),
            f.matching.start_matching("alice", &any),
            f.matching.start_matching("alice", &any),
        );
        for outcome in [a, b, c] {
            assert!(matches!(outcome.unwrap(), MatchOutcome::Waiting { .. }));
        }
        assert_eq!(f.matching.queue_stats().await.unwrap().waiting_voice, 1);
    }

    #[tokio::test]
    async fn test_second_waiting_row_is_rejected() {
        let f = fixture().await;
        let any = criteria(Gender::Other, PreferredGender::Anyone, CallType::Voice);
        let outcome = f.matching.start_matching("alice", &any).await.unwrap();

        let mut duplicate = f.matching.get_request(outcome.request_id()).await.unwrap();
        duplicate.id = "duplicate".to_string();
        assert!(f.storage.insert_matching_request(&duplicate).await.is_err());
    }

    #[tokio::test]
    async fn test_waiter_is_notified_as_joiner() {
        let f = fixture().await;
        let mut alice = f.matching.subscribe("alice");
        let any = criteria(Gender::Female, PreferredGender::Anyone, CallType::Video);

        let waiting = f.matching.start_matching("alice", &any).await.unwrap();
        f.matching.start_matching("bob", &any).await.unwrap();

        let found = alice.recv().await.unwrap();
        assert_eq!(found.request_id, waiting.request_id());
        assert_eq!(found.partner_id, "bob");
        assert_eq!(found.role, CallRole::Joiner);
        assert_eq!(found.call_type, CallType::Video);
    }

    #[tokio::test]
    async fn test_concurrent_arrivals_never_double_claim() {
        let f = fixture().await;
        let mut handles = Vec::new();
        for i in 0..12 {
            let matching = Arc::clone(&f.matching);
            handles.push(tokio::spawn(async move {
                let any = criteria(Gender::Other, PreferredGender::Anyone, CallType::Voice);
                matching.start_matching(&format!("user{}", i), &any).await.unwrap()
            }));
        }

        let mut request_ids = Vec::new();
        for handle in handles {
            request_ids.push(handle.await.unwrap().request_id().to_string());
        }

        let mut per_session: HashMap<String, Vec<String>> = HashMap::new();
        for id in &request_ids {
            let request = f.matching.get_request(id).await.unwrap();
            if request.status == MatchingStatus::Matched {
                per_session
                    .entry(request.call_session_id.clone().unwrap())
                    .or_default()
                    .push(request.user_id.clone());
            }
        }

        assert_eq!(per_session.len(), 6);
        for (session_id, users) in per_session {
            assert_eq!(users.len(), 2, "session {} has {:?}", session_id, users);
            let session = f.registry.get(&session_id).await.unwrap();
            assert!(session.is_participant(&users[0]));
            assert!(session.is_participant(&users[1]));
        }
    }

    #[tokio::test]
    async fn test_cleanup_cancels_stale_requests() {
        let f = fixture().await;
        let old = Utc::now() - Duration::minutes(120);
        let stale = MatchingRequest {
            id: "stale".to_string(),
            user_id: "ghost".to_string(),
            user_gender: Gender::Male,
            preferred_gender: PreferredGender::Anyone,
            call_type: CallType::Video,
            is_premium: false,
            status: MatchingStatus::Waiting,
            matched_with_user_id: None,
            call_session_id: None,
            created_at: old,
            updated_at: old,
        };
        f.storage.insert_matching_request(&stale).await.unwrap();
        f.matching
            .start_matching("fresh", &criteria(Gender::Female, PreferredGender::Women, CallType::Video))
            .await
            .unwrap();

        assert_eq!(f.matching.cleanup_old_requests().await.unwrap(), 1);
        assert_eq!(
            f.matching.get_request("stale").await.unwrap().status,
            MatchingStatus::Cancelled
        );
        assert_eq!(f.matching.queue_stats().await.unwrap().waiting_video, 1);
    }
}
