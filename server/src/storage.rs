//! Database storage layer for DuoCall Server
//!
//! Every status change that can race (matching claims, cancellations, call
//! status updates) is a conditional UPDATE whose affected-row count decides
//! the outcome.

use chrono::{DateTime, Duration, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Executor, Pool, QueryBuilder, Sqlite,
};
use std::path::Path;
use std::str::FromStr;

use crate::crypto;
use crate::models::*;

/// Result of a transactional match claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// Both requests are now `matched` and the session row exists.
    Claimed,
    /// The arriving request was no longer `waiting`.
    OwnTaken,
    /// The candidate was claimed (or cancelled) concurrently.
    CandidateTaken,
}

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_path: &str) -> anyhow::Result<Self> {
        // Ensure directory exists
        if let Some(parent) = Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", database_path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Single-connection in-memory database, used by tests and `--ephemeral` runs.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guest_sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                is_valid INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS matching_requests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                user_gender TEXT NOT NULL,
                preferred_gender TEXT NOT NULL,
                call_type TEXT NOT NULL,
                is_premium INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                matched_with_user_id TEXT,
                call_session_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS call_sessions (
                id TEXT PRIMARY KEY,
                initiator_id TEXT NOT NULL,
                receiver_id TEXT,
                call_type TEXT NOT NULL,
                status TEXT NOT NULL,
                connected_at TEXT,
                ended_at TEXT,
                end_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_guest_user ON guest_sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_requests_queue ON matching_requests(status, call_type, created_at);
            CREATE INDEX IF NOT EXISTS idx_requests_user ON matching_requests(user_id, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_one_waiting
                ON matching_requests(user_id) WHERE status = 'waiting';
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON call_sessions(status, created_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Guest Session Operations
    // ========================================================================

    pub async fn create_guest_session(
        &self,
        user_id: &str,
        token: &str,
        ttl_hours: i64,
    ) -> anyhow::Result<DateTime<Utc>> {
        let token_hash = crypto::hash_token(token);
        let now = Utc::now();
        let expires_at = now + Duration::hours(ttl_hours);

        sqlx::query(
            "INSERT INTO guest_sessions (token_hash, user_id, created_at, expires_at, is_valid)
             VALUES (?, ?, ?, ?, 1)",
        )
        .bind(&token_hash)
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(expires_at)
    }

    pub async fn validate_guest_session(&self, token: &str) -> anyhow::Result<Option<GuestSession>> {
        let token_hash = crypto::hash_token(token);

        let session = sqlx::query_as::<_, GuestSession>(
            "SELECT token_hash, user_id, created_at, expires_at, is_valid
             FROM guest_sessions
             WHERE token_hash = ? AND is_valid = 1",
        )
        .bind(&token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session.filter(|s| s.expires_at > Utc::now()))
    }

    // ========================================================================
    // Matching Request Operations
    // ========================================================================

    async fn insert_matching_request_with<'e, E>(executor: E, request: &MatchingRequest) -> anyhow::Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO matching_requests
             (id, user_id, user_gender, preferred_gender, call_type, is_premium, status,
              matched_with_user_id, call_session_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id)
        .bind(&request.user_id)
        .bind(request.user_gender)
        .bind(request.preferred_gender)
        .bind(request.call_type)
        .bind(request.is_premium)
        .bind(request.status)
        .bind(&request.matched_with_user_id)
        .bind(&request.call_session_id)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn insert_matching_request(&self, request: &MatchingRequest) -> anyhow::Result<()> {
        Self::insert_matching_request_with(&self.pool, request).await
    }

    /// Cancel the user's waiting requests and queue `request` in one
    /// transaction. Returns how many requests were replaced.
    pub async fn requeue_matching_request(&self, request: &MatchingRequest) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;

        let replaced = sqlx::query(
            "UPDATE matching_requests SET status = 'cancelled', updated_at = ?
             WHERE user_id = ? AND status = 'waiting'",
        )
        .bind(request.created_at)
        .bind(&request.user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        Self::insert_matching_request_with(&mut *tx, request).await?;
        tx.commit().await?;

        Ok(replaced)
    }

    pub async fn get_matching_request(&self, id: &str) -> anyhow::Result<Option<MatchingRequest>> {
        let request = sqlx::query_as::<_, MatchingRequest>(
            "SELECT id, user_id, user_gender, preferred_gender, call_type, is_premium, status,
                    matched_with_user_id, call_session_id, created_at, updated_at
             FROM matching_requests WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(request)
    }

    /// Oldest waiting request that is mutually compatible with `own`.
    pub async fn find_oldest_compatible(
        &self,
        own: &MatchingRequest,
    ) -> anyhow::Result<Option<MatchingRequest>> {
        let accepted_genders: Vec<Gender> = [Gender::Male, Gender::Female, Gender::Other]
            .into_iter()
            .filter(|g| own.preferred_gender.accepts(*g))
            .collect();
        let accepting_preferences: Vec<PreferredGender> =
            [PreferredGender::Anyone, PreferredGender::Men, PreferredGender::Women]
                .into_iter()
                .filter(|p| p.accepts(own.user_gender))
                .collect();

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, user_id, user_gender, preferred_gender, call_type, is_premium, status,
                    matched_with_user_id, call_session_id, created_at, updated_at
             FROM matching_requests WHERE status = 'waiting' AND call_type = ",
        );
        query.push_bind(own.call_type);
        query.push(" AND user_id != ");
        query.push_bind(&own.user_id);
        query.push(" AND id != ");
        query.push_bind(&own.id);

        query.push(" AND user_gender IN (");
        let mut genders = query.separated(", ");
        for gender in accepted_genders {
            genders.push_bind(gender);
        }
        genders.push_unseparated(")");

        query.push(" AND preferred_gender IN (");
        let mut preferences = query.separated(", ");
        for preference in accepting_preferences {
            preferences.push_bind(preference);
        }
        preferences.push_unseparated(")");

        query.push(" ORDER BY created_at ASC, id ASC LIMIT 1");

        let candidate = query
            .build_query_as::<MatchingRequest>()
            .fetch_optional(&self.pool)
            .await?;

        Ok(candidate)
    }

    /// Atomically claim `candidate` for `own` and create `session`.
    ///
    /// Both conditional updates and the session insert share one transaction;
    /// any lost condition rolls the whole claim back.
    pub async fn claim_match(
        &self,
        own: &MatchingRequest,
        candidate: &MatchingRequest,
        session: &CallSession,
    ) -> anyhow::Result<ClaimResult> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let own_claimed = sqlx::query(
            "UPDATE matching_requests
             SET status = 'matched', matched_with_user_id = ?, call_session_id = ?, updated_at = ?
             WHERE id = ? AND status = 'waiting'",
        )
        .bind(&candidate.user_id)
        .bind(&session.id)
        .bind(now)
        .bind(&own.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if own_claimed == 0 {
            tx.rollback().await?;
            return Ok(ClaimResult::OwnTaken);
        }

        let candidate_claimed = sqlx::query(
            "UPDATE matching_requests
             SET status = 'matched', matched_with_user_id = ?, call_session_id = ?, updated_at = ?
             WHERE id = ? AND status = 'waiting'",
        )
        .bind(&own.user_id)
        .bind(&session.id)
        .bind(now)
        .bind(&candidate.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if candidate_claimed == 0 {
            tx.rollback().await?;
            return Ok(ClaimResult::CandidateTaken);
        }

        Self::insert_call_session_with(&mut *tx, session).await?;
        tx.commit().await?;

        Ok(ClaimResult::Claimed)
    }

    /// `waiting -> cancelled`; returns false when the request was not waiting.
    pub async fn cancel_waiting_request(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE matching_requests SET status = 'cancelled', updated_at = ?
             WHERE id = ? AND status = 'waiting'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn cancel_stale_requests(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE matching_requests SET status = 'cancelled', updated_at = ?
             WHERE status = 'waiting' AND created_at < ?",
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_waiting(&self, call_type: CallType) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM matching_requests WHERE status = 'waiting' AND call_type = ?",
        )
        .bind(call_type)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    // ========================================================================
    // Call Session Operations
    // ========================================================================

    async fn insert_call_session_with<'e, E>(executor: E, session: &CallSession) -> anyhow::Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO call_sessions
             (id, initiator_id, receiver_id, call_type, status, connected_at, ended_at,
              end_reason, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.initiator_id)
        .bind(&session.receiver_id)
        .bind(session.call_type)
        .bind(session.status)
        .bind(session.connected_at)
        .bind(session.ended_at)
        .bind(session.end_reason)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    pub async fn insert_call_session(&self, session: &CallSession) -> anyhow::Result<()> {
        Self::insert_call_session_with(&self.pool, session).await
    }

    pub async fn get_call_session(&self, id: &str) -> anyhow::Result<Option<CallSession>> {
        let session = sqlx::query_as::<_, CallSession>(
            "SELECT id, initiator_id, receiver_id, call_type, status, connected_at, ended_at,
                    end_reason, created_at, updated_at
             FROM call_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    /// Set the receiver and move `waiting -> connecting` in one conditional update.
    pub async fn attach_receiver(&self, id: &str, receiver_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE call_sessions SET receiver_id = ?, status = 'connecting', updated_at = ?
             WHERE id = ? AND status = 'waiting' AND receiver_id IS NULL",
        )
        .bind(receiver_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Apply `update` only if the current status strictly precedes it.
    pub async fn update_call_status(&self, id: &str, update: StatusUpdate) -> anyhow::Result<bool> {
        let now = Utc::now();
        let target = update.status();

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE call_sessions SET status = ");
        query.push_bind(target);
        query.push(", updated_at = ");
        query.push_bind(now);

        match update {
            StatusUpdate::Connecting => {}
            StatusUpdate::Connected => {
                query.push(", connected_at = COALESCE(connected_at, ");
                query.push_bind(now);
                query.push(")");
            }
            StatusUpdate::Ended(reason) => {
                query.push(", ended_at = ");
                query.push_bind(now);
                query.push(", end_reason = ");
                query.push_bind(reason);
            }
        }

        query.push(" WHERE id = ");
        query.push_bind(id);
        query.push(" AND status IN (");
        let mut allowed = query.separated(", ");
        for status in target.predecessors() {
            allowed.push_bind(status);
        }
        allowed.push_unseparated(")");

        if target != CallStatus::Ended {
            query.push(" AND receiver_id IS NOT NULL");
        }

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// End sessions stuck before `connected`; returns the ended session ids.
    pub async fn end_stale_sessions(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let stale: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM call_sessions
             WHERE status IN ('waiting', 'connecting') AND created_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut ended = Vec::with_capacity(stale.len());
        for (id,) in stale {
            if self
                .update_call_status(&id, StatusUpdate::Ended(EndReason::Timeout))
                .await?
            {
                ended.push(id);
            }
        }

        Ok(ended)
    }

    // ========================================================================
    // Cleanup Operations
    // ========================================================================

    pub async fn cleanup_expired_guest_sessions(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM guest_sessions WHERE expires_at <= ? OR is_valid = 0")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub async fn get_stats(&self) -> anyhow::Result<ServerStats> {
        let requests: Vec<(MatchingStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM matching_requests GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let sessions: Vec<(CallStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM call_sessions GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let request_count = |status: MatchingStatus| {
            requests
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, n)| *n)
                .unwrap_or(0)
        };

        let active_calls = sessions
            .iter()
            .filter(|(s, _)| *s != CallStatus::Ended)
            .map(|(_, n)| *n)
            .sum();
        let ended_calls = sessions
            .iter()
            .filter(|(s, _)| *s == CallStatus::Ended)
            .map(|(_, n)| *n)
            .sum();

        Ok(ServerStats {
            waiting_requests: request_count(MatchingStatus::Waiting),
            matched_requests: request_count(MatchingStatus::Matched),
            cancelled_requests: request_count(MatchingStatus::Cancelled),
            active_calls,
            ended_calls,
        })
    }
}
