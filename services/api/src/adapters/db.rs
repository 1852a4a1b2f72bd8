//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crowdpanel_core::domain::{
    MarketplaceCredentials, NewSession, Profile, Session, Site, Task, WorkerVisit,
};
use crowdpanel_core::ports::{DatabaseService, PortError, PortResult};
use sqlx::{error::ErrorKind, FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the schema at startup if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS profiles (
                id                    UUID PRIMARY KEY,
                api_token             TEXT NOT NULL UNIQUE,
                aws_access_key_id     TEXT,
                aws_secret_access_key TEXT,
                keys_added_at         TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sites (
                id         UUID PRIMARY KEY,
                profile_id UUID NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                url        TEXT NOT NULL,
                rest_key   TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id                UUID PRIMARY KEY,
                site_id           UUID NOT NULL REFERENCES sites(id) ON DELETE CASCADE,
                code              TEXT NOT NULL,
                config_json       TEXT NOT NULL DEFAULT '',
                session_wide_url  TEXT NOT NULL,
                admin_url         TEXT NOT NULL,
                num_participants  INTEGER NOT NULL,
                question_template TEXT NOT NULL DEFAULT '',
                use_sandbox       BOOLEAN,
                expiration        TIMESTAMPTZ,
                task_group_id     TEXT NOT NULL DEFAULT '',
                version           INTEGER NOT NULL DEFAULT 0,
                UNIQUE (site_id, code)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id         TEXT PRIMARY KEY,
                task_group_id   TEXT NOT NULL,
                session_id      UUID NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                max_assignments INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS worker_visits (
                id            UUID PRIMARY KEY,
                session_id    UUID NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                worker_id     TEXT NOT NULL,
                assignment_id TEXT NOT NULL,
                UNIQUE (session_id, worker_id, assignment_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct ProfileRecord {
    id: Uuid,
    aws_access_key_id: Option<String>,
    aws_secret_access_key: Option<String>,
}
impl ProfileRecord {
    fn to_domain(self) -> Profile {
        let marketplace_credentials = match (self.aws_access_key_id, self.aws_secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(MarketplaceCredentials {
                access_key_id,
                secret_access_key,
            }),
            _ => None,
        };
        Profile {
            id: self.id,
            marketplace_credentials,
        }
    }
}

#[derive(FromRow)]
struct SiteRecord {
    id: Uuid,
    profile_id: Uuid,
    url: String,
    rest_key: String,
}
impl SiteRecord {
    fn to_domain(self) -> Site {
        Site {
            id: self.id,
            profile_id: self.profile_id,
            url: self.url,
            rest_key: self.rest_key,
        }
    }
}

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    site_id: Uuid,
    code: String,
    config_json: String,
    session_wide_url: String,
    admin_url: String,
    num_participants: i32,
    question_template: String,
    use_sandbox: Option<bool>,
    expiration: Option<DateTime<Utc>>,
    task_group_id: String,
    version: i32,
}
impl SessionRecord {
    fn to_domain(self) -> Session {
        Session {
            id: self.id,
            site_id: self.site_id,
            code: self.code,
            config_json: self.config_json,
            session_wide_url: self.session_wide_url,
            admin_url: self.admin_url,
            num_participants: self.num_participants,
            question_template: self.question_template,
            use_sandbox: self.use_sandbox,
            expiration: self.expiration,
            task_group_id: self.task_group_id,
            version: self.version,
        }
    }
}

const SESSION_COLUMNS: &str = "id, site_id, code, config_json, session_wide_url, admin_url, \
     num_participants, question_template, use_sandbox, expiration, task_group_id, version";

#[derive(FromRow)]
struct TaskRecord {
    task_id: String,
    task_group_id: String,
    session_id: Uuid,
    max_assignments: i32,
}
impl TaskRecord {
    fn to_domain(self) -> Task {
        Task {
            task_id: self.task_id,
            task_group_id: self.task_group_id,
            session_id: self.session_id,
            max_assignments: self.max_assignments,
        }
    }
}

#[derive(FromRow)]
struct WorkerVisitRecord {
    id: Uuid,
    session_id: Uuid,
    worker_id: String,
    assignment_id: String,
}
impl WorkerVisitRecord {
    fn to_domain(self) -> WorkerVisit {
        WorkerVisit {
            id: self.id,
            session_id: self.session_id,
            worker_id: self.worker_id,
            assignment_id: self.assignment_id,
        }
    }
}

fn not_found(what: &str, err: sqlx::Error) -> PortError {
    match err {
        sqlx::Error::RowNotFound => PortError::NotFound(what.to_string()),
        other => PortError::Unexpected(other.to_string()),
    }
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn get_profile_by_token(&self, api_token: &str) -> PortResult<Profile> {
        let record = sqlx::query_as::<_, ProfileRecord>(
            "SELECT id, aws_access_key_id, aws_secret_access_key FROM profiles WHERE api_token = $1",
        )
        .bind(api_token)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| not_found("This profile", e))?;

        Ok(record.to_domain())
    }

    async fn get_site(&self, site_id: Uuid) -> PortResult<Site> {
        let record = sqlx::query_as::<_, SiteRecord>(
            "SELECT id, profile_id, url, rest_key FROM sites WHERE id = $1",
        )
        .bind(site_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| not_found("This site", e))?;

        Ok(record.to_domain())
    }

    async fn get_session_by_id(&self, session_id: Uuid) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| not_found("This session", e))?;

        Ok(record.to_domain())
    }

    async fn get_session_by_code(&self, code: &str) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE code = $1"
        ))
        .bind(code)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| not_found("This session", e))?;

        Ok(record.to_domain())
    }

    async fn create_session(&self, new_session: NewSession) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "INSERT INTO sessions \
                 (id, site_id, code, config_json, session_wide_url, admin_url, \
                  num_participants, question_template) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(new_session.site_id)
        .bind(&new_session.code)
        .bind(&new_session.config_json)
        .bind(&new_session.session_wide_url)
        .bind(&new_session.admin_url)
        .bind(new_session.num_participants)
        .bind(&new_session.question_template)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e.as_database_error().map(|d| d.kind()) {
            Some(ErrorKind::UniqueViolation) => PortError::Conflict(format!(
                "session {} already exists for this site",
                new_session.code
            )),
            _ => PortError::Unexpected(e.to_string()),
        })?;

        Ok(record.to_domain())
    }

    async fn mark_session_published(
        &self,
        session_id: Uuid,
        expected_version: i32,
        use_sandbox: bool,
        task_group_id: &str,
        expiration: DateTime<Utc>,
    ) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE sessions \
             SET use_sandbox = $1, task_group_id = $2, expiration = $3, version = version + 1 \
             WHERE id = $4 AND version = $5",
        )
        .bind(use_sandbox)
        .bind(task_group_id)
        .bind(expiration)
        .bind(session_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(PortError::Conflict(format!(
                "session {} was modified by another request",
                session_id
            )));
        }
        Ok(())
    }

    async fn set_session_expiration(
        &self,
        session_id: Uuid,
        expected_version: i32,
        expiration: DateTime<Utc>,
    ) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET expiration = $1, version = version + 1 \
             WHERE id = $2 AND version = $3",
        )
        .bind(expiration)
        .bind(session_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(PortError::Conflict(format!(
                "session {} was modified by another request",
                session_id
            )));
        }
        Ok(())
    }

    async fn create_task(&self, task: Task) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO tasks (task_id, task_group_id, session_id, max_assignments) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&task.task_id)
        .bind(&task.task_group_id)
        .bind(task.session_id)
        .bind(task.max_assignments)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(())
    }

    async fn tasks_for_session(&self, session_id: Uuid) -> PortResult<Vec<Task>> {
        let records = sqlx::query_as::<_, TaskRecord>(
            "SELECT task_id, task_group_id, session_id, max_assignments \
             FROM tasks WHERE session_id = $1 ORDER BY task_id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn record_worker_visit(
        &self,
        session_id: Uuid,
        worker_id: &str,
        assignment_id: &str,
    ) -> PortResult<()> {
        // Repeat visits hit the unique constraint and are dropped silently.
        sqlx::query(
            "INSERT INTO worker_visits (id, session_id, worker_id, assignment_id) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (session_id, worker_id, assignment_id) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(worker_id)
        .bind(assignment_id)
        .execute(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(())
    }

    async fn worker_visits_for_session(&self, session_id: Uuid) -> PortResult<Vec<WorkerVisit>> {
        let records = sqlx::query_as::<_, WorkerVisitRecord>(
            "SELECT id, session_id, worker_id, assignment_id \
             FROM worker_visits WHERE session_id = $1 ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }

    async fn worker_visits_for_workers(
        &self,
        session_id: Uuid,
        worker_ids: &[String],
    ) -> PortResult<Vec<WorkerVisit>> {
        let records = sqlx::query_as::<_, WorkerVisitRecord>(
            "SELECT id, session_id, worker_id, assignment_id \
             FROM worker_visits WHERE session_id = $1 AND worker_id = ANY($2) ORDER BY id",
        )
        .bind(session_id)
        .bind(worker_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        Ok(records.into_iter().map(|r| r.to_domain()).collect())
    }
}
