//! services/api/src/web/reconcile_task.rs
//!
//! The reconciliation workflow behind the payments page: pull every
//! submission the marketplace knows about for this session's tasks, reject
//! the ones that never passed through our redirect, and bucket the locally
//! recorded workers by review status, enriched with payoff data from the
//! hosting service.

use std::collections::{HashMap, HashSet};

use crate::error::ApiError;
use crate::web::rest::load_owned_session;
use crate::web::state::AppState;
use axum::{
    extract::{Extension, Path, State},
    response::{IntoResponse, Json},
};
use crowdpanel_core::domain::{
    dedup_earliest, extract_completion_code, status_by_worker, Participant, Profile, Session, Site,
    Submission, SubmissionStatus, WorkerReview, WorkerVisit,
};
use crowdpanel_core::ports::{HostingService, MarketplaceClient, PortResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// Feedback attached to every auto-reject. The marketplace shows it to the
/// worker, so it has to say something.
const ORPHAN_REJECT_FEEDBACK: &str =
    "Auto-rejecting because this assignment was not found in our database.";

//=========================================================================================
// Assignment normalization
//=========================================================================================

/// Accumulates every page of every task's submission listing, following the
/// continuation cursor until the marketplace runs dry.
pub async fn fetch_all_submissions(
    client: &dyn MarketplaceClient,
    task_ids: &[String],
) -> PortResult<Vec<Submission>> {
    let mut submissions = Vec::new();

    for task_id in task_ids {
        let mut cursor: Option<String> = None;
        loop {
            let page = client.list_submissions(task_id, cursor.as_deref()).await?;
            if page.submissions.is_empty() {
                break;
            }
            submissions.extend(page.submissions);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
    }

    Ok(submissions)
}

//=========================================================================================
// The reconciliation report
//=========================================================================================

#[derive(Debug, Serialize)]
pub struct ReconciliationReport {
    pub approved: Vec<WorkerReview>,
    pub rejected: Vec<WorkerReview>,
    pub pending_review: Vec<WorkerReview>,
    /// Assignment ids auto-rejected during this request.
    pub orphans_rejected: Vec<String>,
    /// Assignment ids whose auto-reject call failed; they will be picked up
    /// again on the next load.
    pub orphan_reject_failures: Vec<String>,
    pub participation_fee: f64,
}

/// Cross-references the marketplace's submissions against our recorded
/// visits and produces the payments-page buckets.
///
/// A "submitted" assignment we have no visit for means the worker bypassed
/// the redirect; left alone the marketplace would auto-approve it after a
/// timeout, so each one is rejected here. One failed reject does not stop
/// the others.
pub async fn build_report(
    session: &Session,
    site: &Site,
    visits: &[WorkerVisit],
    task_ids: &[String],
    client: &dyn MarketplaceClient,
    hosting: &dyn HostingService,
) -> Result<ReconciliationReport, ApiError> {
    let submissions = dedup_earliest(fetch_all_submissions(client, task_ids).await?);

    let visited_workers: HashSet<&str> = visits.iter().map(|v| v.worker_id.as_str()).collect();

    let mut orphans_rejected = Vec::new();
    let mut orphan_reject_failures = Vec::new();
    for submission in &submissions {
        let is_orphan = submission.status == SubmissionStatus::Submitted
            && !visited_workers.contains(submission.worker_id.as_str());
        if !is_orphan {
            continue;
        }
        match client
            .reject_submission(&submission.assignment_id, ORPHAN_REJECT_FEEDBACK)
            .await
        {
            Ok(()) => orphans_rejected.push(submission.assignment_id.clone()),
            Err(e) => {
                warn!(
                    "Failed to auto-reject orphan assignment {}: {}",
                    submission.assignment_id, e
                );
                orphan_reject_failures.push(submission.assignment_id.clone());
            }
        }
    }

    let statuses = status_by_worker(&submissions);
    let answers: HashMap<&str, &str> = submissions
        .iter()
        .map(|s| (s.worker_id.as_str(), s.answer.as_str()))
        .collect();

    let mut listable: Vec<(&WorkerVisit, SubmissionStatus)> = Vec::new();
    for visit in visits {
        if let Some(status) = statuses.get(&visit.worker_id) {
            listable.push((visit, *status));
        }
    }

    // One batched payoff lookup for every listed worker.
    let labels: Vec<String> = listable
        .iter()
        .map(|(visit, _)| visit.worker_id.clone())
        .collect();
    let data = hosting
        .fetch_session_data(site, &session.code, &labels)
        .await?;
    let participants: HashMap<&str, &Participant> = data
        .participants
        .iter()
        .map(|p| (p.label.as_str(), p))
        .collect();

    let participation_fee = session
        .config()
        .map_err(|e| ApiError::BadRequest(format!("The session config is invalid: {}", e)))?
        .participation_fee;

    let mut approved = Vec::new();
    let mut rejected = Vec::new();
    let mut pending_review = Vec::new();
    for (visit, status) in listable {
        let participant = participants.get(visit.worker_id.as_str());
        let payoff = participant.map(|p| p.payoff_in_real_world_currency).unwrap_or(0.0);
        let review = WorkerReview {
            worker_id: visit.worker_id.clone(),
            assignment_id: visit.assignment_id.clone(),
            completion_code: extract_completion_code(
                answers.get(visit.worker_id.as_str()).unwrap_or(&""),
            ),
            payoff,
            payoff_plus_participation_fee: payoff + participation_fee,
            finished: participant.and_then(|p| p.finished),
            participant_code: participant.map(|p| p.code.clone()).unwrap_or_default(),
        };
        match status {
            SubmissionStatus::Approved => approved.push(review),
            SubmissionStatus::Rejected => rejected.push(review),
            SubmissionStatus::Submitted => pending_review.push(review),
        }
    }

    Ok(ReconciliationReport {
        approved,
        rejected,
        pending_review,
        orphans_rejected,
        orphan_reject_failures,
        participation_fee,
    })
}

//=========================================================================================
// Handler
//=========================================================================================

pub async fn payments_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile): Extension<Profile>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, site) = load_owned_session(&state, &profile, &code).await?;

    if !session.was_published() {
        return Err(ApiError::BadRequest(
            "This session has not been published".to_string(),
        ));
    }
    let credentials = profile.marketplace_credentials.as_ref().ok_or_else(|| {
        ApiError::BadRequest("No marketplace credentials on file".to_string())
    })?;
    let client = state
        .marketplace
        .connect(credentials, session.use_sandbox.unwrap_or(true));

    let task_ids: Vec<String> = state
        .db
        .tasks_for_session(session.id)
        .await?
        .into_iter()
        .map(|t| t.task_id)
        .collect();
    let visits = state.db.worker_visits_for_session(session.id).await?;

    let report = build_report(
        &session,
        &site,
        &visits,
        &task_ids,
        client.as_ref(),
        state.hosting.as_ref(),
    )
    .await?;

    Ok(Json(report))
}

//=========================================================================================
// Tests
//=========================================================================================
