//! crates/crowdpanel_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application, plus the
//! pure decision logic of the worker-reconciliation and payment workflows:
//! micro-batch planning, submission deduplication, status partitioning,
//! completion-code extraction and idempotency tokens.
//! These are independent of any database or HTTP client.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The marketplace caps how many assignments one task should carry; larger
/// participant pools are split across several tasks in the same group.
pub const MICROBATCH_SIZE: i32 = 9;

//=========================================================================================
// Experimenter-owned entities
//=========================================================================================

/// An experimenter account. Owns sites and the marketplace credentials
/// used for every outbound marketplace call.
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: Uuid,
    pub marketplace_credentials: Option<MarketplaceCredentials>,
}

#[derive(Debug, Clone)]
pub struct MarketplaceCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// An experiment-hosting endpoint: base URL plus the REST key that
/// authenticates us against it.
#[derive(Debug, Clone)]
pub struct Site {
    pub id: Uuid,
    pub profile_id: Uuid,
    pub url: String,
    pub rest_key: String,
}

//=========================================================================================
// Session and its marketplace state
//=========================================================================================

/// One published study run on a Site, identified by a site-unique `code`.
///
/// `version` is bumped on every published-state write; writers pass the
/// version they read and get a conflict back if someone else won the race.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub site_id: Uuid,
    pub code: String,
    pub config_json: String,
    pub session_wide_url: String,
    pub admin_url: String,
    pub num_participants: i32,
    pub question_template: String,
    pub use_sandbox: Option<bool>,
    pub expiration: Option<DateTime<Utc>>,
    pub task_group_id: String,
    pub version: i32,
}

/// The subset of the cached hosting-service config this system reads.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub participation_fee: f64,
    pub mturk_hit_settings: Option<TaskSettings>,
}

impl Session {
    pub fn config(&self) -> Result<SessionConfig, serde_json::Error> {
        serde_json::from_str(&self.config_json)
    }

    pub fn was_published(&self) -> bool {
        !self.task_group_id.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        self.expiration.map(|e| e < Utc::now()).unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        self.was_published() && !self.is_expired()
    }

    pub fn readable_status(&self) -> &'static str {
        if self.is_active() {
            "Active"
        } else if self.is_expired() {
            "Expired"
        } else {
            "Unpublished"
        }
    }

    /// Tasks created in one publish request share a group, and the group is
    /// what the marketplace's public preview page is keyed on. The sandbox
    /// and the live site use different subdomains but the same URL shape.
    pub fn worker_preview_url(&self) -> Option<String> {
        if !self.was_published() {
            return None;
        }
        let subdomain = if self.use_sandbox.unwrap_or(true) {
            "workersandbox"
        } else {
            "www"
        };
        Some(format!(
            "https://{}.mturk.com/mturk/preview?groupId={}",
            subdomain, self.task_group_id
        ))
    }
}

/// The fields needed to import a session from its hosting service.
/// Everything else on [`Session`] starts out unset.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub site_id: Uuid,
    pub code: String,
    pub config_json: String,
    pub session_wide_url: String,
    pub admin_url: String,
    pub num_participants: i32,
    pub question_template: String,
}

/// One published marketplace task batch belonging to a Session.
/// Never mutated after creation.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    pub task_group_id: String,
    pub session_id: Uuid,
    pub max_assignments: i32,
}

/// A record that a marketplace worker passed through the redirect endpoint
/// for a Session. The same worker may visit more than once (returning and
/// re-accepting a task); each distinct (worker, assignment) pair is stored
/// exactly once.
#[derive(Debug, Clone)]
pub struct WorkerVisit {
    pub id: Uuid,
    pub session_id: Uuid,
    pub worker_id: String,
    pub assignment_id: String,
}

//=========================================================================================
// Marketplace wire types (transient, never persisted)
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmissionStatus {
    Submitted,
    Approved,
    Rejected,
}

/// The marketplace's view of one worker's attempt at a task. Re-derived
/// from the marketplace on every request; the store of record is theirs.
#[derive(Debug, Clone)]
pub struct Submission {
    pub worker_id: String,
    pub assignment_id: String,
    pub status: SubmissionStatus,
    pub answer: String,
    pub submitted_at: DateTime<Utc>,
}

/// One page of a submission listing; `next_cursor` continues the listing.
#[derive(Debug, Clone)]
pub struct SubmissionPage {
    pub submissions: Vec<Submission>,
    pub next_cursor: Option<String>,
}

/// Everything one task-creation call needs. `unique_request_token` makes a
/// replayed publish request a no-op on the marketplace side.
#[derive(Debug, Clone)]
pub struct TaskBatchParams {
    pub title: String,
    pub description: String,
    pub keywords: String,
    pub max_assignments: i32,
    pub reward: String,
    pub assignment_duration_secs: i64,
    pub lifetime_secs: i64,
    pub unique_request_token: String,
    pub question_html: String,
    pub qualification_requirements: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task_id: String,
    pub task_group_id: String,
    pub expiration: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BonusPayment {
    pub worker_id: String,
    pub assignment_id: String,
    pub amount: String,
    pub unique_request_token: String,
    pub reason: String,
}

//=========================================================================================
// Hosting-service wire types
//=========================================================================================

/// The hosting service's description of a session, as returned by its
/// session endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionData {
    pub config: serde_json::Value,
    pub num_participants: i32,
    pub session_wide_url: String,
    pub admin_url: String,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub mturk_template_html: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Participant {
    pub label: String,
    pub payoff_in_real_world_currency: f64,
    #[serde(default)]
    pub finished: Option<bool>,
    #[serde(default)]
    pub code: String,
}

/// A worker row on the payments page: the local visit joined with the
/// marketplace status and the hosting service's payoff data.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReview {
    pub worker_id: String,
    pub assignment_id: String,
    pub completion_code: String,
    pub payoff: f64,
    pub payoff_plus_participation_fee: f64,
    pub finished: Option<bool>,
    pub participant_code: String,
}

/// Task settings cached from the hosting service's session config.
/// Keywords arrive either as free text or as a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    pub keywords: Keywords,
    pub title: String,
    pub description: String,
    pub frame_height: i32,
    #[serde(default)]
    pub template: Option<String>,
    pub minutes_allotted_per_assignment: i64,
    pub expiration_hours: f64,
    #[serde(default)]
    pub qualification_requirements: Vec<serde_json::Value>,
    #[serde(default)]
    pub grant_qualification_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Keywords {
    Joined(String),
    List(Vec<String>),
}

impl Keywords {
    pub fn joined(&self) -> String {
        match self {
            Keywords::Joined(s) => s.clone(),
            Keywords::List(items) => items.join(", "),
        }
    }
}

//=========================================================================================
// Pure workflow logic
//=========================================================================================

/// Splits the participant target into bounded task batches.
///
/// Each participant slot is doubled so dropped or returned assignments can
/// be replaced without republishing, then split into batches of at most
/// [`MICROBATCH_SIZE`], the trailing remainder forming its own batch.
pub fn plan_batch_sizes(num_participants: i32) -> Vec<i32> {
    let total_slots = num_participants * 2;
    if total_slots <= 0 {
        return Vec::new();
    }
    let full_batches = total_slots / MICROBATCH_SIZE;
    let remainder = total_slots % MICROBATCH_SIZE;
    let mut sizes = vec![MICROBATCH_SIZE; full_batches as usize];
    if remainder > 0 {
        sizes.push(remainder);
    }
    sizes
}

/// Reduces the raw submission listing to one submission per worker.
///
/// A worker who returns a task and accepts another one in the same group
/// shows up more than once; only the chronologically first submission is
/// authoritative. The ascending sort is what makes that selection stable,
/// so it stays in front of the scan.
pub fn dedup_earliest(mut submissions: Vec<Submission>) -> Vec<Submission> {
    submissions.sort_by_key(|s| s.submitted_at);
    let mut seen: HashSet<String> = HashSet::new();
    submissions
        .into_iter()
        .filter(|s| seen.insert(s.worker_id.clone()))
        .collect()
}

/// Maps worker id to submission status over an already-deduplicated set.
pub fn status_by_worker(submissions: &[Submission]) -> HashMap<String, SubmissionStatus> {
    submissions
        .iter()
        .map(|s| (s.worker_id.clone(), s.status))
        .collect()
}

#[derive(Debug, Deserialize)]
struct AnswerDocument {
    #[serde(default)]
    answers: Vec<AnswerEntry>,
}

#[derive(Debug, Deserialize)]
struct AnswerEntry {
    key: String,
    #[serde(default)]
    free_text: String,
}

/// Pulls the completion code out of a submission's answer document.
///
/// The document is a collection of answer entries; the one keyed
/// `taskAnswers` carries a JSON-encoded array whose first object holds
/// `completion_code`. Anything missing or malformed yields an empty string
/// rather than an error, since workers routinely submit empty forms.
pub fn extract_completion_code(answer: &str) -> String {
    if answer.is_empty() {
        return String::new();
    }
    let document: AnswerDocument = match serde_json::from_str(answer) {
        Ok(d) => d,
        Err(_) => return String::new(),
    };
    for entry in document.answers {
        if entry.key == "taskAnswers" {
            let parsed: Vec<serde_json::Value> = match serde_json::from_str(&entry.free_text) {
                Ok(v) => v,
                Err(_) => return String::new(),
            };
            return parsed
                .first()
                .and_then(|obj| obj.get("completion_code"))
                .and_then(|code| code.as_str())
                .unwrap_or_default()
                .to_string();
        }
    }
    String::new()
}

/// The bonus idempotency token: a pure function of the visit record and its
/// assignment, so replaying a payment for the same visit never double-pays.
pub fn bonus_token(visit: &WorkerVisit) -> String {
    format!("{}_{}", visit.id, visit.assignment_id)
}

/// The task-creation idempotency token for batch `batch_index` of a session.
pub fn publish_token(session_code: &str, batch_index: usize) -> String {
    format!("otree_{}_{}", session_code, batch_index)
}

/// Money crosses the marketplace wire as a string with exactly two decimals.
pub fn format_money(amount: f64) -> String {
    format!("{:.2}", amount)
}

//=========================================================================================
// Tests
//=========================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn submission(worker: &str, assignment: &str, minute: u32) -> Submission {
        Submission {
            worker_id: worker.to_string(),
            assignment_id: assignment.to_string(),
            status: SubmissionStatus::Submitted,
            answer: String::new(),
            submitted_at: Utc.with_ymd_and_hms(2021, 6, 1, 12, minute, 0).unwrap(),
        }
    }

    #[test]
    fn batch_plan_splits_doubled_slots() {
        assert_eq!(plan_batch_sizes(10), vec![9, 9, 2]);
        assert_eq!(plan_batch_sizes(4), vec![8]);
        assert_eq!(plan_batch_sizes(9), vec![9, 9]);
    }

    #[test]
    fn batch_plan_is_empty_for_zero_participants() {
        assert!(plan_batch_sizes(0).is_empty());
    }

    #[test]
    fn dedup_keeps_earliest_submission_per_worker() {
        let subs = vec![
            submission("w1", "a3", 30),
            submission("w2", "a2", 10),
            submission("w1", "a1", 5),
        ];
        let deduped = dedup_earliest(subs);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].worker_id, "w1");
        assert_eq!(deduped[0].assignment_id, "a1");
        assert_eq!(deduped[1].worker_id, "w2");
    }

    #[test]
    fn dedup_of_empty_set_is_empty() {
        assert!(dedup_earliest(Vec::new()).is_empty());
    }

    #[test]
    fn completion_code_is_extracted_from_task_answers() {
        let answer = r#"{"answers": [{"key": "taskAnswers", "free_text": "[{\"completion_code\": \"ABC123\"}]"}]}"#;
        assert_eq!(extract_completion_code(answer), "ABC123");
    }

    #[test]
    fn completion_code_is_empty_when_key_missing() {
        let answer = r#"{"answers": [{"key": "feedback", "free_text": "great"}]}"#;
        assert_eq!(extract_completion_code(answer), "");
        assert_eq!(extract_completion_code(""), "");
        assert_eq!(extract_completion_code("not json"), "");
    }

    #[test]
    fn completion_code_is_empty_for_malformed_inner_json() {
        let answer = r#"{"answers": [{"key": "taskAnswers", "free_text": "not json"}]}"#;
        assert_eq!(extract_completion_code(answer), "");
    }

    #[test]
    fn bonus_token_is_deterministic() {
        let visit = WorkerVisit {
            id: Uuid::nil(),
            session_id: Uuid::nil(),
            worker_id: "w1".to_string(),
            assignment_id: "a1".to_string(),
        };
        assert_eq!(bonus_token(&visit), bonus_token(&visit));
        assert_eq!(bonus_token(&visit), format!("{}_a1", Uuid::nil()));
    }

    #[test]
    fn publish_tokens_differ_per_batch() {
        assert_eq!(publish_token("code1", 0), "otree_code1_0");
        assert_ne!(publish_token("code1", 0), publish_token("code1", 1));
    }

    #[test]
    fn money_is_formatted_to_two_decimals() {
        assert_eq!(format_money(1.5), "1.50");
        assert_eq!(format_money(0.125), "0.13");
        assert_eq!(format_money(2.0), "2.00");
    }

    #[test]
    fn keywords_join_from_list_or_string() {
        assert_eq!(
            Keywords::List(vec!["survey".to_string(), "easy".to_string()]).joined(),
            "survey, easy"
        );
        assert_eq!(
            Keywords::Joined("survey, easy".to_string()).joined(),
            "survey, easy"
        );
    }

    #[test]
    fn session_status_reflects_publication_and_expiry() {
        let mut session = Session {
            id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            code: "abc123".to_string(),
            config_json: "{}".to_string(),
            session_wide_url: "http://example.com/join".to_string(),
            admin_url: "http://example.com/admin".to_string(),
            num_participants: 10,
            question_template: String::new(),
            use_sandbox: None,
            expiration: None,
            task_group_id: String::new(),
            version: 0,
        };
        assert_eq!(session.readable_status(), "Unpublished");
        assert!(session.worker_preview_url().is_none());

        session.task_group_id = "GROUP1".to_string();
        session.use_sandbox = Some(false);
        session.expiration = Some(Utc::now() + chrono::Duration::hours(1));
        assert_eq!(session.readable_status(), "Active");
        assert_eq!(
            session.worker_preview_url().unwrap(),
            "https://www.mturk.com/mturk/preview?groupId=GROUP1"
        );

        session.expiration = Some(Utc::now() - chrono::Duration::hours(1));
        assert_eq!(session.readable_status(), "Expired");
    }
}
