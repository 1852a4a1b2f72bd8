//! crates/crowdpanel_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    BonusPayment, CreatedTask, MarketplaceCredentials, NewSession, Profile, Session, SessionData,
    Site, SubmissionPage, Task, TaskBatchParams, WorkerVisit,
};

//=========================================================================================
// Port Error and Result Types
//=========================================================================================

/// The error taxonomy shared by all ports.
///
/// Hosting-service failures are split by where they happened (transport,
/// their 4xx, their 5xx); marketplace failures are funneled through one
/// variant that names the operation and keeps the underlying error chained,
/// since the marketplace surfaces a wide variety of failure shapes that
/// callers never distinguish.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("could not reach the experiment host: {0}")]
    Unreachable(String),

    #[error("the experiment host rejected the request with status {status}: {message}")]
    Client { status: u16, message: String },

    #[error("the experiment host failed with status {status}: {message}")]
    Server { status: u16, message: String },

    #[error("marketplace call {op} failed: {source}")]
    Marketplace {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{0} was not found in the database")]
    NotFound(String),

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("an unexpected error occurred: {0}")]
    Unexpected(String),
}

impl PortError {
    /// Shorthand used by the marketplace adapter at every call site.
    pub fn marketplace<E>(op: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PortError::Marketplace {
            op,
            source: Box::new(source),
        }
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Experimenter lookup ---
    async fn get_profile_by_token(&self, api_token: &str) -> PortResult<Profile>;

    // --- Sites ---
    async fn get_site(&self, site_id: Uuid) -> PortResult<Site>;

    // --- Sessions ---
    async fn get_session_by_id(&self, session_id: Uuid) -> PortResult<Session>;

    async fn get_session_by_code(&self, code: &str) -> PortResult<Session>;

    async fn create_session(&self, new_session: NewSession) -> PortResult<Session>;

    /// Persists the published state written at the end of a successful
    /// publish run. `expected_version` is the version the caller read; a
    /// mismatch means another workflow touched the row first.
    async fn mark_session_published(
        &self,
        session_id: Uuid,
        expected_version: i32,
        use_sandbox: bool,
        task_group_id: &str,
        expiration: DateTime<Utc>,
    ) -> PortResult<()>;

    /// Same version discipline as `mark_session_published`.
    async fn set_session_expiration(
        &self,
        session_id: Uuid,
        expected_version: i32,
        expiration: DateTime<Utc>,
    ) -> PortResult<()>;

    // --- Tasks ---
    async fn create_task(&self, task: Task) -> PortResult<()>;

    async fn tasks_for_session(&self, session_id: Uuid) -> PortResult<Vec<Task>>;

    // --- Worker visits ---
    /// Records the redirect visit. Repeat visits with the same
    /// (worker, assignment) pair must not create a second row.
    async fn record_worker_visit(
        &self,
        session_id: Uuid,
        worker_id: &str,
        assignment_id: &str,
    ) -> PortResult<()>;

    async fn worker_visits_for_session(&self, session_id: Uuid) -> PortResult<Vec<WorkerVisit>>;

    /// The visits for a caller-selected set of workers, in no particular order.
    async fn worker_visits_for_workers(
        &self,
        session_id: Uuid,
        worker_ids: &[String],
    ) -> PortResult<Vec<WorkerVisit>>;
}

#[async_trait]
pub trait HostingService: Send + Sync {
    /// Fetches session config, participant count, entry URLs and per-label
    /// payoff data from the hosting service in one call.
    async fn fetch_session_data(
        &self,
        site: &Site,
        code: &str,
        participant_labels: &[String],
    ) -> PortResult<SessionData>;

    /// Write-through of session variables to the hosting service; no local
    /// state changes.
    async fn push_session_vars(
        &self,
        site: &Site,
        code: &str,
        vars: serde_json::Value,
    ) -> PortResult<()>;
}

/// A handle bound to exactly one marketplace environment (sandbox or
/// production). Every method is a single retryless network call.
#[async_trait]
pub trait MarketplaceClient: Send + Sync {
    async fn create_task_batch(&self, params: &TaskBatchParams) -> PortResult<CreatedTask>;

    /// One page of submissions for a task, filtered to the reviewable
    /// statuses; pass the returned cursor back in to continue the listing.
    async fn list_submissions(
        &self,
        task_id: &str,
        cursor: Option<&str>,
    ) -> PortResult<SubmissionPage>;

    async fn approve_submission(&self, assignment_id: &str) -> PortResult<()>;

    async fn reject_submission(&self, assignment_id: &str, feedback: &str) -> PortResult<()>;

    async fn send_bonus(&self, bonus: &BonusPayment) -> PortResult<()>;

    /// An expiration in the past force-expires the task immediately.
    async fn update_task_expiration(
        &self,
        task_id: &str,
        expire_at: DateTime<Utc>,
    ) -> PortResult<()>;
}

/// Builds a [`MarketplaceClient`] for one experimenter's credentials,
/// pinned to the sandbox or the production endpoint. The two environments
/// are never mixed within one handle.
pub trait MarketplaceConnector: Send + Sync {
    fn connect(
        &self,
        credentials: &MarketplaceCredentials,
        use_sandbox: bool,
    ) -> Arc<dyn MarketplaceClient>;
}
