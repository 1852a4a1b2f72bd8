//! services/api/src/web/publish_task.rs
//!
//! The task-publication workflow: split the participant target into
//! micro-batches, create one marketplace task per batch, and persist the
//! session's published state once every batch has been created. Also holds
//! the force-expire workflow for published sessions.

use crate::error::ApiError;
use crate::web::rest::load_owned_session;
use crate::web::state::AppState;
use axum::{
    extract::{Extension, Path, State},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, TimeZone, Utc};
use crowdpanel_core::domain::{
    format_money, plan_batch_sizes, publish_token, Profile, Session, Task, TaskBatchParams,
    TaskSettings,
};
use crowdpanel_core::ports::{DatabaseService, MarketplaceClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// The marketplace renders the task inside an iframe whose content we host;
/// the submit form posts back to the marketplace itself.
const HTML_QUESTION_TEMPLATE: &str = r#"<HTMLQuestion xmlns="http://mechanicalturk.amazonaws.com/AWSMechanicalTurkDataSchemas/2011-11-11/HTMLQuestion.xsd">
  <HTMLContent><![CDATA[
<!DOCTYPE html>
<html>
  <head>
    <meta http-equiv="Content-Type" content="text/html; charset=UTF-8" />
    <script type="text/javascript" src="https://s3.amazonaws.com/mturk-public/externalHIT_v1.js"></script>
  </head>
  <body>
    <form name="mturk_form" method="post" id="mturk_form" action="https://www.mturk.com/mturk/externalSubmit">
      <input type="hidden" value="" name="assignmentId" id="assignmentId" />
      <p><a href="{start_url}" target="_blank">Click here to begin the study</a></p>
      {question_template}
      <p><input type="submit" id="submitButton" value="Submit" /></p>
    </form>
    <script language="Javascript">turkSetAssignmentID();</script>
  </body>
</html>
]]></HTMLContent>
  <FrameHeight>{frame_height}</FrameHeight>
</HTMLQuestion>"#;

fn render_question_html(frame_height: i32, start_url: &str, question_template: &str) -> String {
    HTML_QUESTION_TEMPLATE
        .replace("{frame_height}", &frame_height.to_string())
        .replace("{start_url}", start_url)
        .replace("{question_template}", question_template)
}

/// Live publication is refused when this service is not reachable from the
/// public internet, since marketplace workers could never get back to us.
fn is_public_host(base_url: &str) -> bool {
    let parsed = match url::Url::parse(base_url) {
        Ok(u) => u,
        Err(_) => return false,
    };
    match parsed.host_str().map(str::to_lowercase) {
        Some(host) => host != "localhost" && host != "127.0.0.1",
        None => false,
    }
}

//=========================================================================================
// The publication workflow
//=========================================================================================

#[derive(Debug, Serialize)]
pub struct PublishOutcome {
    pub num_tasks: usize,
    pub task_group_id: String,
    pub expiration: DateTime<Utc>,
}

/// Creates one marketplace task per planned batch and records each locally
/// as it is created. Any failure aborts the rest of the run; already-created
/// tasks stay recorded, and a retried publish reuses the same per-batch
/// request tokens so the marketplace does not create duplicates.
pub async fn publish_session(
    db: &dyn DatabaseService,
    client: &dyn MarketplaceClient,
    session: &Session,
    settings: &TaskSettings,
    participation_fee: f64,
    start_url: &str,
    use_sandbox: bool,
) -> Result<PublishOutcome, ApiError> {
    let batch_sizes = plan_batch_sizes(session.num_participants);
    if batch_sizes.is_empty() {
        return Err(ApiError::BadRequest(
            "This session has no participants, so there is nothing to publish".to_string(),
        ));
    }

    let question_html =
        render_question_html(settings.frame_height, start_url, &session.question_template);
    let keywords = settings.keywords.joined();

    let mut last_created = None;
    for (i, batch_size) in batch_sizes.iter().enumerate() {
        let params = TaskBatchParams {
            title: settings.title.clone(),
            description: settings.description.clone(),
            keywords: keywords.clone(),
            max_assignments: *batch_size,
            reward: format_money(participation_fee),
            assignment_duration_secs: 60 * settings.minutes_allotted_per_assignment,
            lifetime_secs: (60.0 * 60.0 * settings.expiration_hours) as i64,
            unique_request_token: publish_token(&session.code, i),
            question_html: question_html.clone(),
            // Qualification filtering would lock our own test workers out of
            // the sandbox, so it only applies to live publication.
            qualification_requirements: if use_sandbox {
                None
            } else {
                Some(settings.qualification_requirements.clone())
            },
        };

        let created = client.create_task_batch(&params).await?;
        db.create_task(Task {
            task_id: created.task_id.clone(),
            task_group_id: created.task_group_id.clone(),
            session_id: session.id,
            max_assignments: *batch_size,
        })
        .await?;
        last_created = Some(created);
    }

    let last = last_created
        .ok_or_else(|| ApiError::Internal("publication produced no tasks".to_string()))?;

    db.mark_session_published(
        session.id,
        session.version,
        use_sandbox,
        &last.task_group_id,
        last.expiration,
    )
    .await?;

    info!(
        "Published session {} as {} tasks in group {}",
        session.code,
        batch_sizes.len(),
        last.task_group_id
    );

    Ok(PublishOutcome {
        num_tasks: batch_sizes.len(),
        task_group_id: last.task_group_id,
        expiration: last.expiration,
    })
}

//=========================================================================================
// Handlers
//=========================================================================================

#[derive(Deserialize)]
pub struct PublishRequest {
    pub use_sandbox: bool,
}

pub async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile): Extension<Profile>,
    Path(code): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, _site) = load_owned_session(&state, &profile, &code).await?;

    if session.was_published() {
        return Err(ApiError::BadRequest(
            "This session has already been published".to_string(),
        ));
    }
    if !req.use_sandbox && !is_public_host(&state.config.public_base_url) {
        return Err(ApiError::Forbidden(
            "The service must run on a public domain to publish outside the sandbox".to_string(),
        ));
    }

    let config = session
        .config()
        .map_err(|e| ApiError::BadRequest(format!("The session config is invalid: {}", e)))?;
    let settings = config.mturk_hit_settings.ok_or_else(|| {
        ApiError::BadRequest("mturk_hit_settings not found in the session config".to_string())
    })?;
    let credentials = profile.marketplace_credentials.as_ref().ok_or_else(|| {
        ApiError::BadRequest(
            "No marketplace credentials on file; add your AWS keys to your profile first"
                .to_string(),
        )
    })?;

    let client = state.marketplace.connect(credentials, req.use_sandbox);
    let start_url = format!("{}/redirect/{}", state.config.public_base_url, session.id);

    let outcome = publish_session(
        state.db.as_ref(),
        client.as_ref(),
        &session,
        &settings,
        config.participation_fee,
        &start_url,
        req.use_sandbox,
    )
    .await?;

    Ok(Json(outcome))
}

pub async fn expire_handler(
    State(state): State<Arc<AppState>>,
    Extension(profile): Extension<Profile>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (session, _site) = load_owned_session(&state, &profile, &code).await?;

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

    // A time in the past expires each task immediately.
    let expiration = Utc
        .with_ymd_and_hms(2015, 1, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| ApiError::Internal("could not build expiration timestamp".to_string()))?;

    for task in state.db.tasks_for_session(session.id).await? {
        client
            .update_task_expiration(&task.task_id, expiration)
            .await?;
    }
    state
        .db
        .set_session_expiration(session.id, session.version, expiration)
        .await?;

    Ok(Json(serde_json::json!({
        "message": format!("Expired session {}", session.code)
    })))
}

//=========================================================================================
// Tests
//=========================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::test_support::{session_fixture, settings_fixture, MarketplaceCall, MockDb, MockMarketplace};

    #[tokio::test]
    async fn publishes_micro_batches_and_persists_last_expiration() {
        let db = MockDb::default();
        let client = MockMarketplace::default();
        let session = session_fixture(10);
        let settings = settings_fixture();

        let outcome = publish_session(
            &db,
            &client,
            &session,
            &settings,
            1.5,
            "https://panel.example.org/redirect/abc",
            false,
        )
        .await
        .unwrap();

        assert_eq!(outcome.num_tasks, 3);
        assert_eq!(outcome.task_group_id, "GROUP1");

        let created = db.created_tasks.lock().unwrap();
        assert_eq!(created.len(), 3);
        assert_eq!(
            created.iter().map(|t| t.max_assignments).collect::<Vec<_>>(),
            vec![9, 9, 2]
        );

        let published = db.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (_, _, use_sandbox, group, expiration) = published[0].clone();
        assert!(!use_sandbox);
        assert_eq!(group, "GROUP1");
        // Expiration must come from the last created batch.
        assert_eq!(expiration, client.expiration_for_call(2));
    }

    #[tokio::test]
    async fn request_tokens_are_unique_per_batch() {
        let db = MockDb::default();
        let client = MockMarketplace::default();
        let session = session_fixture(10);
        let settings = settings_fixture();

        publish_session(&db, &client, &session, &settings, 1.5, "https://x.org/r/1", true)
            .await
            .unwrap();

        let calls = client.calls.lock().unwrap();
        let tokens: Vec<String> = calls
            .iter()
            .filter_map(|c| match c {
                MarketplaceCall::CreateBatch { token, .. } => Some(token.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], "otree_abc123_0");
        assert!(tokens.iter().collect::<std::collections::HashSet<_>>().len() == 3);
    }

    #[tokio::test]
    async fn qualification_requirements_only_apply_outside_sandbox() {
        for (use_sandbox, expect_qualifications) in [(true, false), (false, true)] {
            let db = MockDb::default();
            let client = MockMarketplace::default();
            let session = session_fixture(1);
            let settings = settings_fixture();

            publish_session(&db, &client, &session, &settings, 1.0, "https://x.org/r/1", use_sandbox)
                .await
                .unwrap();

            let calls = client.calls.lock().unwrap();
            match &calls[0] {
                MarketplaceCall::CreateBatch {
                    has_qualifications, ..
                } => assert_eq!(*has_qualifications, expect_qualifications),
                other => panic!("unexpected call {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn zero_participants_publishes_nothing() {
        let db = MockDb::default();
        let client = MockMarketplace::default();
        let session = session_fixture(0);
        let settings = settings_fixture();

        let result = publish_session(
            &db,
            &client,
            &session,
            &settings,
            1.0,
            "https://x.org/r/1",
            true,
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(client.calls.lock().unwrap().is_empty());
        assert!(db.created_tasks.lock().unwrap().is_empty());
    }

    #[test]
    fn public_host_detection() {
        assert!(is_public_host("https://panel.example.org"));
        assert!(!is_public_host("http://localhost:3000"));
        assert!(!is_public_host("http://127.0.0.1:8000"));
        assert!(!is_public_host("not a url"));
    }

    #[test]
    fn question_html_embeds_template_and_frame_height() {
        let html = render_question_html(500, "https://x.org/r/1", "<p>hello</p>");
        assert!(html.contains("<FrameHeight>500</FrameHeight>"));
        assert!(html.contains("https://x.org/r/1"));
        assert!(html.contains("<p>hello</p>"));
    }
}
