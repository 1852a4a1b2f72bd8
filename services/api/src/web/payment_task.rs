//! services/api/src/web/payment_task.rs
//!
//! The payment workflow: for a caller-selected set of workers, look up each
//! payoff in one batched hosting-service call, send the bonus, then approve
//! the assignment. Failures are isolated per worker up to a fixed budget,
//! after which the rest of the batch is abandoned. Also holds the manual
//! bulk-reject workflow.

use std::collections::HashMap;

use crate::error::ApiError;
use crate::web::rest::load_owned_session;
use crate::web::state::AppState;
use axum::{
    extract::{Extension, Path, State},
    response::{IntoResponse, Json},
};
use crowdpanel_core::domain::{
    bonus_token, format_money, BonusPayment, Profile, Session, Site, WorkerVisit,
};
use crowdpanel_core::ports::{HostingService, MarketplaceClient, PortResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// After this many per-worker failures the rest of the batch is abandoned;
/// something systemic is wrong and retrying worker after worker only digs
/// the hole deeper.
const MAX_FAILED_PAYMENTS: u32 = 10;

//=========================================================================================
// The payment driver
//=========================================================================================

#[derive(Debug, Serialize)]
pub struct PaymentOutcome {
    pub successful: u32,
    pub failed: u32,
    pub aborted: bool,
}

impl PaymentOutcome {
    pub fn message(&self) -> String {
        let mut msg = format!("Successfully made {} payments.", self.successful);
        if self.failed > 0 {
            msg.push_str(&format!(" {} payments failed.", self.failed));
        }
        msg
    }
}

async fn pay_one(
    client: &dyn MarketplaceClient,
    visit: &WorkerVisit,
    payoff: f64,
) -> PortResult<()> {
    if payoff > 0.0 {
        client
            .send_bonus(&BonusPayment {
                worker_id: visit.worker_id.clone(),
                assignment_id: visit.assignment_id.clone(),
                amount: format_money(payoff),
                // The token is stable across retries, so a replayed payment
                // never pays twice.
                unique_request_token: bonus_token(visit),
                // this field is required.
                reason: "Thank you".to_string(),
            })
            .await?;
    }
    // Approval happens AFTER the bonus: if the bonus fails, the worker stays
    // in the pending bucket and can be retried. The worst case is a bonus
    // that succeeded followed by a failed approval; on retry the bonus call
    // errors on its request token, the approval goes through, and nobody is
    // paid twice.
    client.approve_submission(&visit.assignment_id).await?;
    Ok(())
}

/// Pays the given visits in caller order. Returns exact success/failure
/// counts; `aborted` is set when the failure budget ran out with workers
/// still unprocessed.
pub async fn pay_workers(
    client: &dyn MarketplaceClient,
    hosting: &dyn HostingService,
    session: &Session,
    site: &Site,
    visits: &[WorkerVisit],
) -> Result<PaymentOutcome, ApiError> {
    let labels: Vec<String> = visits.iter().map(|v| v.worker_id.clone()).collect();
    let data = hosting
        .fetch_session_data(site, &session.code, &labels)
        .await?;
    let payoffs: HashMap<&str, f64> = data
        .participants
        .iter()
        .map(|p| (p.label.as_str(), p.payoff_in_real_world_currency))
        .collect();

    let mut successful = 0;
    let mut failed = 0;
    let mut aborted = false;

    for visit in visits {
        let payoff = payoffs.get(visit.worker_id.as_str()).copied().unwrap_or(0.0);

        match pay_one(client, visit, payoff).await {
            Ok(()) => successful += 1,
            Err(e) => {
                error!(
                    "Could not pay {} because of an error communicating with the marketplace: {}",
                    visit.worker_id, e
                );
                failed += 1;
                if failed > MAX_FAILED_PAYMENTS {
                    aborted = true;
                    break;
                }
            }
        }
    }

    Ok(PaymentOutcome {
        successful,
        failed,
        aborted,
    })
}

//=========================================================================================
// Handlers
//=========================================================================================

#[derive(Deserialize)]
pub struct WorkerSelection {
    pub workers: Vec<String>,
}

#[derive(Serialize)]
pub struct PaymentResponse {
    pub successful: u32,
    pub failed: u32,
    pub aborted: bool,
    pub message: String,
}

pub async fn pay_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile): Extension<Profile>,
    Path(code): Path<String>,
    Json(req): Json<WorkerSelection>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, site) = load_owned_session(&state, &profile, &code).await?;

    let credentials = profile.marketplace_credentials.as_ref().ok_or_else(|| {
        ApiError::BadRequest("No marketplace credentials on file".to_string())
    })?;
    let client = state
        .marketplace
        .connect(credentials, session.use_sandbox.unwrap_or(true));

    let visits = state
        .db
        .worker_visits_for_workers(session.id, &req.workers)
        .await?;

    let outcome = pay_workers(
        client.as_ref(),
        state.hosting.as_ref(),
        &session,
        &site,
        &visits,
    )
    .await?;

    let response = PaymentResponse {
        successful: outcome.successful,
        failed: outcome.failed,
        aborted: outcome.aborted,
        message: outcome.message(),
    };
    Ok(Json(response))
}

/// Rejects every selected worker's assignment. Unlike payment there is no
/// per-worker isolation here; the first marketplace failure aborts the
/// request.
pub async fn reject_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile): Extension<Profile>,
    Path(code): Path<String>,
    Json(req): Json<WorkerSelection>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, _site) = load_owned_session(&state, &profile, &code).await?;

    let credentials = profile.marketplace_credentials.as_ref().ok_or_else(|| {
        ApiError::BadRequest("No marketplace credentials on file".to_string())
    })?;
    let client = state
        .marketplace
        .connect(credentials, session.use_sandbox.unwrap_or(true));

    let visits = state
        .db
        .worker_visits_for_workers(session.id, &req.workers)
        .await?;

    for visit in &visits {
        // The feedback parameter is documented as optional but the
        // marketplace rejects a null value, so an empty string goes out.
        client.reject_submission(&visit.assignment_id, "").await?;
    }

    Ok(Json(serde_json::json!({
        "message": "You successfully rejected the selected assignments"
    })))
}

//=========================================================================================
// Tests
//=========================================================================================
