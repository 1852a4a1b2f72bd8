//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification. The publish, payments and pay
//! workflows live in their own modules; what is here is session import,
//! session status, the completion-URL write-through, and the public worker
//! redirect.

use crate::error::ApiError;
use crate::web::state::AppState;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Redirect},
};
use chrono::{DateTime, Utc};
use crowdpanel_core::domain::{NewSession, Profile, Session, Site};
use crowdpanel_core::ports::PortError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        import_session_handler,
    ),
    components(
        schemas(ImportSessionRequest, ImportSessionResponse)
    ),
    tags(
        (name = "Crowdpanel API", description = "API endpoints for linking hosted experiment sessions to crowd-labor marketplaces.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Shared helpers
//=========================================================================================

/// Loads a session by code and verifies it belongs to one of the calling
/// experimenter's sites. A session owned by someone else reads as absent.
pub(crate) async fn load_owned_session(
    state: &AppState,
    profile: &Profile,
    code: &str,
) -> Result<(Session, Site), ApiError> {
    let session = state.db.get_session_by_code(code).await?;
    let site = state.db.get_site(session.site_id).await?;
    if site.profile_id != profile.id {
        return Err(ApiError::Port(PortError::NotFound(
            "This session".to_string(),
        )));
    }
    Ok((session, site))
}

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct ImportSessionRequest {
    pub code: String,
}

/// The response payload sent after successfully importing a session.
#[derive(Serialize, ToSchema)]
pub struct ImportSessionResponse {
    session_id: Uuid,
    code: String,
    num_participants: i32,
}

#[derive(Serialize)]
pub struct SessionStatusResponse {
    code: String,
    status: &'static str,
    was_published: bool,
    is_active: bool,
    is_expired: bool,
    use_sandbox: Option<bool>,
    expiration: Option<DateTime<Utc>>,
    num_participants: i32,
    worker_preview_url: Option<String>,
    admin_url: String,
}

#[derive(Deserialize)]
pub struct CompletionUrlRequest {
    pub completion_url: String,
}

#[derive(Deserialize)]
pub struct RedirectQuery {
    #[serde(rename = "assignmentId")]
    pub assignment_id: String,
    #[serde(rename = "workerId")]
    pub worker_id: String,
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Import a hosting-service session so it can be published to the marketplace.
///
/// Fetches the session's config and entry URLs from the hosting service and
/// caches them locally. Fails cleanly when the session config carries no
/// marketplace settings.
#[utoipa::path(
    post,
    path = "/sites/{site_id}/sessions",
    request_body = ImportSessionRequest,
    responses(
        (status = 201, description = "Session imported successfully", body = ImportSessionResponse),
        (status = 400, description = "Session config has no marketplace settings"),
        (status = 404, description = "Site not found"),
        (status = 502, description = "Hosting service unreachable or failing")
    ),
    params(
        ("site_id" = Uuid, Path, description = "The site to import from.")
    )
)]
pub async fn import_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile): Extension<Profile>,
    Path(site_id): Path<Uuid>,
    Json(req): Json<ImportSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let site = state.db.get_site(site_id).await?;
    if site.profile_id != profile.id {
        return Err(ApiError::Port(PortError::NotFound("This site".to_string())));
    }

    let session_data = state
        .hosting
        .fetch_session_data(&site, &req.code, &[])
        .await?;

    if session_data.config.get("mturk_hit_settings").is_none() {
        return Err(ApiError::BadRequest(
            "mturk_hit_settings not found in the session config".to_string(),
        ));
    }

    let config_json = serde_json::to_string(&session_data.config)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let session = state
        .db
        .create_session(NewSession {
            site_id: site.id,
            code: req.code.clone(),
            config_json,
            session_wide_url: session_data.session_wide_url,
            admin_url: session_data.admin_url,
            num_participants: session_data.num_participants,
            question_template: session_data.mturk_template_html,
        })
        .await?;

    info!("Imported session {} for site {}", session.code, site.id);

    let response = ImportSessionResponse {
        session_id: session.id,
        code: session.code,
        num_participants: session.num_participants,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// Session status for the manage page: published/active/expired plus the
/// public preview URL when one exists.
pub async fn session_status_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile): Extension<Profile>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, _site) = load_owned_session(&state, &profile, &code).await?;

    let response = SessionStatusResponse {
        status: session.readable_status(),
        was_published: session.was_published(),
        is_active: session.is_active(),
        is_expired: session.is_expired(),
        use_sandbox: session.use_sandbox,
        expiration: session.expiration,
        num_participants: session.num_participants,
        worker_preview_url: session.worker_preview_url(),
        admin_url: session.admin_url.clone(),
        code: session.code,
    };
    Ok(Json(response))
}

/// Pushes the study's completion URL to the hosting service as a session
/// variable, so finished participants can be sent back to the marketplace.
pub async fn completion_url_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile): Extension<Profile>,
    Path(code): Path<String>,
    Json(req): Json<CompletionUrlRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, site) = load_owned_session(&state, &profile, &code).await?;

    state
        .hosting
        .push_session_vars(
            &site,
            &session.code,
            json!({ "prolific_completion_url": req.completion_url }),
        )
        .await?;

    Ok(Json(json!({
        "message": "Sent your completion URL to your oTree site"
    })))
}

/// The public entry point the marketplace sends workers through.
///
/// Records the visit (repeat visits with the same worker and assignment ids
/// leave exactly one row) and forwards the browser to the hosting service
/// with the worker id as the participant label.
pub async fn redirect_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<RedirectQuery>,
) -> Result<Redirect, ApiError> {
    let session = state.db.get_session_by_id(session_id).await?;

    state
        .db
        .record_worker_visit(session.id, &query.worker_id, &query.assignment_id)
        .await?;

    let target = format!(
        "{}?participant_label={}",
        session.session_wide_url, query.worker_id
    );
    Ok(Redirect::to(&target))
}
