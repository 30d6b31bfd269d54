//! Session record repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::session::{Session, SessionState};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    job: String,
    state: String,
    generation: i64,
    recovered: i64,
    failure: Option<String>,
    stats: String,
    history: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    fn into_session(self) -> Result<Session> {
        let job = serde_json::from_str(&self.job)
            .map_err(|e| AppError::Db(format!("invalid job: {e}")))?;
        let failure = self
            .failure
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid failure: {e}")))?;
        let stats = serde_json::from_str(&self.stats)
            .map_err(|e| AppError::Db(format!("invalid stats: {e}")))?;
        let history = serde_json::from_str(&self.history)
            .map_err(|e| AppError::Db(format!("invalid history: {e}")))?;
        let generation = u32::try_from(self.generation)
            .map_err(|e| AppError::Db(format!("invalid generation: {e}")))?;

        Ok(Session {
            id: self.id,
            job,
            state: SessionState::parse(&self.state)?,
            generation,
            recovered: self.recovered != 0,
            failure,
            stats,
            history,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
        })
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

fn to_json<T: serde::Serialize>(field: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| AppError::Db(format!("serialize {field}: {e}")))
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the record for `session`.
    ///
    /// `finished_at` is stamped the first time the session is stored in a
    /// terminal state and kept afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if serialization or the write fails.
    pub async fn upsert(&self, session: &Session) -> Result<()> {
        let job = to_json("job", &session.job)?;
        let failure = session
            .failure
            .as_ref()
            .map(|f| to_json("failure", f))
            .transpose()?;
        let stats = to_json("stats", &session.stats)?;
        let history = to_json("history", &session.history)?;
        let finished_at = session
            .state
            .is_terminal()
            .then(|| session.updated_at.to_rfc3339());

        sqlx::query(
            "INSERT INTO session (id, job, priority, state, generation, recovered, failure,
             stats, history, created_at, updated_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                generation = excluded.generation,
                recovered = excluded.recovered,
                failure = excluded.failure,
                stats = excluded.stats,
                history = excluded.history,
                updated_at = excluded.updated_at,
                finished_at = COALESCE(session.finished_at, excluded.finished_at)",
        )
        .bind(&session.id)
        .bind(&job)
        .bind(session.job.priority())
        .bind(session.state.as_str())
        .bind(i64::from(session.generation))
        .bind(i64::from(session.recovered))
        .bind(&failure)
        .bind(&stats)
        .bind(&history)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(&finished_at)
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Retrieve a session by identifier.
    ///
    /// Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM session WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// All sessions in creation order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM session ORDER BY created_at ASC, rowid ASC")
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Sessions not yet in a terminal state, in creation order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_unfinished(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM session
             WHERE state IN ('queued','running','paused','resuming')
             ORDER BY created_at ASC, rowid ASC",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Delete terminal sessions that finished before `cutoff`, returning
    /// their identifiers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "DELETE FROM session
             WHERE state IN ('completed','failed','cancelled')
               AND finished_at IS NOT NULL AND finished_at < ?1
             RETURNING id",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(self.db.as_ref())
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
