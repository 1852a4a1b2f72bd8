//! services/api/src/adapters/marketplace.rs
//!
//! This module contains the adapter for the MTurk requester API. It
//! implements the `MarketplaceClient` and `MarketplaceConnector` ports from
//! the `core` crate. A client handle is pinned to either the sandbox or the
//! production endpoint at connect time; the two are never mixed.
//!
//! Every call site maps its specific failure (transport, HTTP status,
//! payload decoding) into `PortError::Marketplace`, naming the operation and
//! chaining the underlying error for diagnostics.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use crowdpanel_core::domain::{
    BonusPayment, CreatedTask, MarketplaceCredentials, Submission, SubmissionPage,
    SubmissionStatus, TaskBatchParams,
};
use crowdpanel_core::ports::{MarketplaceClient, MarketplaceConnector, PortError, PortResult};
use serde::Deserialize;
use serde_json::json;

/// Submissions in any other state are not reviewable and never listed.
const LISTABLE_STATUSES: [&str; 3] = ["Submitted", "Approved", "Rejected"];

/// The marketplace caps listing pages at 100 entries.
const PAGE_SIZE: u32 = 100;

//=========================================================================================
// Adapter-local error type (chained into `PortError::Marketplace`)
//=========================================================================================

#[derive(Debug, thiserror::Error)]
enum MturkCallError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode response: {0}")]
    Decode(String),
}

//=========================================================================================
// Connector
//=========================================================================================

/// Builds per-experimenter MTurk client handles. Holds one shared HTTP
/// client and the two endpoint URLs from configuration.
#[derive(Clone)]
pub struct MturkConnector {
    http: reqwest::Client,
    sandbox_endpoint: String,
    live_endpoint: String,
}

impl MturkConnector {
    pub fn new(http: reqwest::Client, sandbox_endpoint: String, live_endpoint: String) -> Self {
        Self {
            http,
            sandbox_endpoint,
            live_endpoint,
        }
    }
}

impl MarketplaceConnector for MturkConnector {
    fn connect(
        &self,
        credentials: &MarketplaceCredentials,
        use_sandbox: bool,
    ) -> Arc<dyn MarketplaceClient> {
        let endpoint = if use_sandbox {
            self.sandbox_endpoint.clone()
        } else {
            self.live_endpoint.clone()
        };
        Arc::new(MturkAdapter {
            http: self.http.clone(),
            endpoint,
            credentials: credentials.clone(),
        })
    }
}

//=========================================================================================
// The Client Adapter Struct
//=========================================================================================

/// An adapter that implements the `MarketplaceClient` port against one MTurk
/// requester endpoint.
pub struct MturkAdapter {
    http: reqwest::Client,
    endpoint: String,
    credentials: MarketplaceCredentials,
}

impl MturkAdapter {
    /// One operation call. The requester API is a single POST endpoint
    /// dispatched on the target header, speaking `x-amz-json-1.1`.
    async fn call(&self, op: &'static str, body: serde_json::Value) -> PortResult<serde_json::Value> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(
                "X-Amz-Target",
                format!("MTurkRequesterServiceV20170117.{}", op),
            )
            .header("Content-Type", "application/x-amz-json-1.1")
            .basic_auth(
                &self.credentials.access_key_id,
                Some(&self.credentials.secret_access_key),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| PortError::marketplace(op, MturkCallError::Transport(e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PortError::marketplace(
                op,
                MturkCallError::Status {
                    status: status.as_u16(),
                    body,
                },
            ));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| PortError::marketplace(op, MturkCallError::Decode(e.to_string())))
    }

    fn decode<T: serde::de::DeserializeOwned>(
        op: &'static str,
        value: serde_json::Value,
    ) -> PortResult<T> {
        serde_json::from_value(value)
            .map_err(|e| PortError::marketplace(op, MturkCallError::Decode(e.to_string())))
    }
}

//=========================================================================================
// Wire types
//=========================================================================================

#[derive(Deserialize)]
struct CreateHitResponse {
    #[serde(rename = "HIT")]
    hit: HitData,
}

#[derive(Deserialize)]
struct HitData {
    #[serde(rename = "HITId")]
    hit_id: String,
    #[serde(rename = "HITGroupId")]
    hit_group_id: String,
    #[serde(rename = "Expiration")]
    expiration: f64,
}

#[derive(Deserialize)]
struct ListAssignmentsResponse {
    #[serde(rename = "Assignments", default)]
    assignments: Vec<AssignmentData>,
    #[serde(rename = "NextToken", default)]
    next_token: Option<String>,
}

#[derive(Deserialize)]
struct AssignmentData {
    #[serde(rename = "WorkerId")]
    worker_id: String,
    #[serde(rename = "AssignmentId")]
    assignment_id: String,
    #[serde(rename = "AssignmentStatus")]
    status: String,
    #[serde(rename = "Answer", default)]
    answer: String,
    #[serde(rename = "SubmitTime")]
    submit_time: f64,
}

fn epoch_to_datetime(op: &'static str, epoch: f64) -> PortResult<DateTime<Utc>> {
    Utc.timestamp_opt(epoch as i64, 0).single().ok_or_else(|| {
        PortError::marketplace(
            op,
            MturkCallError::Decode(format!("timestamp {} out of range", epoch)),
        )
    })
}

fn parse_status(op: &'static str, raw: &str) -> PortResult<SubmissionStatus> {
    match raw {
        "Submitted" => Ok(SubmissionStatus::Submitted),
        "Approved" => Ok(SubmissionStatus::Approved),
        "Rejected" => Ok(SubmissionStatus::Rejected),
        other => Err(PortError::marketplace(
            op,
            MturkCallError::Decode(format!("unknown assignment status '{}'", other)),
        )),
    }
}

//=========================================================================================
// `MarketplaceClient` Trait Implementation
//=========================================================================================

#[async_trait]
impl MarketplaceClient for MturkAdapter {
    async fn create_task_batch(&self, params: &TaskBatchParams) -> PortResult<CreatedTask> {
        const OP: &str = "CreateHIT";

        let mut body = json!({
            "Title": params.title,
            "Description": params.description,
            "Keywords": params.keywords,
            "MaxAssignments": params.max_assignments,
            "Reward": params.reward,
            "AssignmentDurationInSeconds": params.assignment_duration_secs,
            "LifetimeInSeconds": params.lifetime_secs,
            "UniqueRequestToken": params.unique_request_token,
            "Question": params.question_html,
        });
        if let Some(requirements) = &params.qualification_requirements {
            body["QualificationRequirements"] = json!(requirements);
        }

        let value = self.call(OP, body).await?;
        let response: CreateHitResponse = Self::decode(OP, value)?;
        Ok(CreatedTask {
            task_id: response.hit.hit_id,
            task_group_id: response.hit.hit_group_id,
            expiration: epoch_to_datetime(OP, response.hit.expiration)?,
        })
    }

    async fn list_submissions(
        &self,
        task_id: &str,
        cursor: Option<&str>,
    ) -> PortResult<SubmissionPage> {
        const OP: &str = "ListAssignmentsForHIT";

        let mut body = json!({
            "HITId": task_id,
            "MaxResults": PAGE_SIZE,
            "AssignmentStatuses": LISTABLE_STATUSES,
        });
        if let Some(token) = cursor {
            body["NextToken"] = json!(token);
        }

        let value = self.call(OP, body).await?;
        let response: ListAssignmentsResponse = Self::decode(OP, value)?;

        let mut submissions = Vec::with_capacity(response.assignments.len());
        for assignment in response.assignments {
            submissions.push(Submission {
                status: parse_status(OP, &assignment.status)?,
                submitted_at: epoch_to_datetime(OP, assignment.submit_time)?,
                worker_id: assignment.worker_id,
                assignment_id: assignment.assignment_id,
                answer: assignment.answer,
            });
        }
        Ok(SubmissionPage {
            submissions,
            next_cursor: response.next_token,
        })
    }

    async fn approve_submission(&self, assignment_id: &str) -> PortResult<()> {
        self.call("ApproveAssignment", json!({ "AssignmentId": assignment_id }))
            .await?;
        Ok(())
    }

    async fn reject_submission(&self, assignment_id: &str, feedback: &str) -> PortResult<()> {
        // RequesterFeedback is documented as optional but the API rejects
        // a null value, so it is always sent.
        self.call(
            "RejectAssignment",
            json!({
                "AssignmentId": assignment_id,
                "RequesterFeedback": feedback,
            }),
        )
        .await?;
        Ok(())
    }

    async fn send_bonus(&self, bonus: &BonusPayment) -> PortResult<()> {
        self.call(
            "SendBonus",
            json!({
                "WorkerId": bonus.worker_id,
                "AssignmentId": bonus.assignment_id,
                "BonusAmount": bonus.amount,
                "UniqueRequestToken": bonus.unique_request_token,
                "Reason": bonus.reason,
            }),
        )
        .await?;
        Ok(())
    }

    async fn update_task_expiration(
        &self,
        task_id: &str,
        expire_at: DateTime<Utc>,
    ) -> PortResult<()> {
        self.call(
            "UpdateExpirationForHIT",
            json!({
                "HITId": task_id,
                "ExpireAt": expire_at.timestamp(),
            }),
        )
        .await?;
        Ok(())
    }
}
