//! services/api/src/web/test_support.rs
//!
//! In-memory port implementations and fixtures shared by the workflow tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use crowdpanel_core::domain::{
    BonusPayment, CreatedTask, Keywords, NewSession, Participant, Profile, Session, SessionData,
    Site, Submission, SubmissionPage, SubmissionStatus, Task, TaskBatchParams, TaskSettings,
    WorkerVisit,
};
use crowdpanel_core::ports::{
    DatabaseService, HostingService, MarketplaceClient, PortError, PortResult,
};
use serde_json::json;
use uuid::Uuid;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap()
}

fn scripted_failure(op: &'static str) -> PortError {
    PortError::marketplace(
        op,
        std::io::Error::new(std::io::ErrorKind::Other, "scripted marketplace failure"),
    )
}

//=========================================================================================
// Fixtures
//=========================================================================================

pub(crate) fn session_fixture(num_participants: i32) -> Session {
    let config = json!({
        "participation_fee": 1.5,
        "mturk_hit_settings": {
            "keywords": ["survey", "study"],
            "title": "Short research study",
            "description": "A brief academic study",
            "frame_height": 500,
            "minutes_allotted_per_assignment": 60,
            "expiration_hours": 7.0,
            "qualification_requirements": [],
        },
    });
    Session {
        id: Uuid::new_v4(),
        site_id: Uuid::new_v4(),
        code: "abc123".to_string(),
        config_json: config.to_string(),
        session_wide_url: "http://host.example.org/join/abc123".to_string(),
        admin_url: "http://host.example.org/admin/abc123".to_string(),
        num_participants,
        question_template: "<p>task body</p>".to_string(),
        use_sandbox: None,
        expiration: None,
        task_group_id: String::new(),
        version: 0,
    }
}

pub(crate) fn settings_fixture() -> TaskSettings {
    TaskSettings {
        keywords: Keywords::List(vec!["survey".to_string(), "study".to_string()]),
        title: "Short research study".to_string(),
        description: "A brief academic study".to_string(),
        frame_height: 500,
        template: None,
        minutes_allotted_per_assignment: 60,
        expiration_hours: 7.0,
        qualification_requirements: vec![json!({
            "QualificationTypeId": "00000000000000000071",
            "Comparator": "EqualTo",
            "LocaleValues": [{"Country": "US"}],
        })],
        grant_qualification_id: None,
    }
}

pub(crate) fn site_fixture() -> Site {
    Site {
        id: Uuid::new_v4(),
        profile_id: Uuid::new_v4(),
        url: "http://host.example.org".to_string(),
        rest_key: "secret".to_string(),
    }
}

pub(crate) fn visit_fixture(session: &Session, worker_id: &str, assignment_id: &str) -> WorkerVisit {
    WorkerVisit {
        id: Uuid::new_v4(),
        session_id: session.id,
        worker_id: worker_id.to_string(),
        assignment_id: assignment_id.to_string(),
    }
}

pub(crate) fn participant_fixture(label: &str, payoff: f64, code: &str) -> Participant {
    Participant {
        label: label.to_string(),
        payoff_in_real_world_currency: payoff,
        finished: Some(true),
        code: code.to_string(),
    }
}

pub(crate) fn submission_fixture(
    worker_id: &str,
    assignment_id: &str,
    status: SubmissionStatus,
    minute: i64,
) -> Submission {
    Submission {
        worker_id: worker_id.to_string(),
        assignment_id: assignment_id.to_string(),
        status,
        answer: String::new(),
        submitted_at: base_time() + Duration::minutes(minute),
    }
}

pub(crate) trait SubmissionExt {
    fn with_answer(self, answer: &str) -> Submission;
}

impl SubmissionExt for Submission {
    fn with_answer(mut self, answer: &str) -> Submission {
        self.answer = answer.to_string();
        self
    }
}

//=========================================================================================
// Mock database
//=========================================================================================

#[derive(Default)]
pub(crate) struct MockDb {
    pub created_tasks: Mutex<Vec<Task>>,
    pub published: Mutex<Vec<(Uuid, i32, bool, String, DateTime<Utc>)>>,
    pub expirations: Mutex<Vec<(Uuid, i32, DateTime<Utc>)>>,
}

#[async_trait]
impl DatabaseService for MockDb {
    async fn get_profile_by_token(&self, _api_token: &str) -> PortResult<Profile> {
        Err(PortError::Unexpected("not used in this test".to_string()))
    }

    async fn get_site(&self, _site_id: Uuid) -> PortResult<Site> {
        Err(PortError::Unexpected("not used in this test".to_string()))
    }

    async fn get_session_by_id(&self, _session_id: Uuid) -> PortResult<Session> {
        Err(PortError::Unexpected("not used in this test".to_string()))
    }

    async fn get_session_by_code(&self, _code: &str) -> PortResult<Session> {
        Err(PortError::Unexpected("not used in this test".to_string()))
    }

    async fn create_session(&self, _new_session: NewSession) -> PortResult<Session> {
        Err(PortError::Unexpected("not used in this test".to_string()))
    }

    async fn mark_session_published(
        &self,
        session_id: Uuid,
        expected_version: i32,
        use_sandbox: bool,
        task_group_id: &str,
        expiration: DateTime<Utc>,
    ) -> PortResult<()> {
        self.published.lock().unwrap().push((
            session_id,
            expected_version,
            use_sandbox,
            task_group_id.to_string(),
            expiration,
        ));
        Ok(())
    }

    async fn set_session_expiration(
        &self,
        session_id: Uuid,
        expected_version: i32,
        expiration: DateTime<Utc>,
    ) -> PortResult<()> {
        self.expirations
            .lock()
            .unwrap()
            .push((session_id, expected_version, expiration));
        Ok(())
    }

    async fn create_task(&self, task: Task) -> PortResult<()> {
        self.created_tasks.lock().unwrap().push(task);
        Ok(())
    }

    async fn tasks_for_session(&self, _session_id: Uuid) -> PortResult<Vec<Task>> {
        Ok(self.created_tasks.lock().unwrap().clone())
    }

    async fn record_worker_visit(
        &self,
        _session_id: Uuid,
        _worker_id: &str,
        _assignment_id: &str,
    ) -> PortResult<()> {
        Err(PortError::Unexpected("not used in this test".to_string()))
    }

    async fn worker_visits_for_session(&self, _session_id: Uuid) -> PortResult<Vec<WorkerVisit>> {
        Err(PortError::Unexpected("not used in this test".to_string()))
    }

    async fn worker_visits_for_workers(
        &self,
        _session_id: Uuid,
        _worker_ids: &[String],
    ) -> PortResult<Vec<WorkerVisit>> {
        Err(PortError::Unexpected("not used in this test".to_string()))
    }
}

//=========================================================================================
// Mock marketplace
//=========================================================================================

#[derive(Debug, Clone)]
pub(crate) enum MarketplaceCall {
    CreateBatch {
        token: String,
        max_assignments: i32,
        has_qualifications: bool,
    },
    ListPage {
        task_id: String,
        cursor: Option<String>,
    },
    Approve {
        assignment_id: String,
    },
    Reject {
        assignment_id: String,
        feedback: String,
    },
    Bonus {
        worker_id: String,
        assignment_id: String,
        amount: String,
        token: String,
    },
    UpdateExpiration {
        task_id: String,
    },
}

#[derive(Default)]
pub(crate) struct MockMarketplace {
    pub calls: Mutex<Vec<MarketplaceCall>>,
    fail_bonus_workers: Mutex<HashSet<String>>,
    fail_reject_assignments: Mutex<HashSet<String>>,
    pages: Mutex<HashMap<String, Vec<SubmissionPage>>>,
    created_count: AtomicUsize,
}

impl MockMarketplace {
    pub fn fail_bonus(&self, worker_id: &str) {
        self.fail_bonus_workers
            .lock()
            .unwrap()
            .insert(worker_id.to_string());
    }

    pub fn fail_reject(&self, assignment_id: &str) {
        self.fail_reject_assignments
            .lock()
            .unwrap()
            .insert(assignment_id.to_string());
    }

    pub fn script_pages(&self, task_id: &str, pages: Vec<SubmissionPage>) {
        self.pages.lock().unwrap().insert(task_id.to_string(), pages);
    }

    /// The expiration the mock attaches to the nth created batch.
    pub fn expiration_for_call(&self, n: usize) -> DateTime<Utc> {
        base_time() + Duration::hours(n as i64)
    }
}

#[async_trait]
impl MarketplaceClient for MockMarketplace {
    async fn create_task_batch(&self, params: &TaskBatchParams) -> PortResult<CreatedTask> {
        let n = self.created_count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(MarketplaceCall::CreateBatch {
            token: params.unique_request_token.clone(),
            max_assignments: params.max_assignments,
            has_qualifications: params.qualification_requirements.is_some(),
        });
        Ok(CreatedTask {
            task_id: format!("TASK{}", n),
            task_group_id: "GROUP1".to_string(),
            expiration: self.expiration_for_call(n),
        })
    }

    async fn list_submissions(
        &self,
        task_id: &str,
        cursor: Option<&str>,
    ) -> PortResult<SubmissionPage> {
        self.calls.lock().unwrap().push(MarketplaceCall::ListPage {
            task_id: task_id.to_string(),
            cursor: cursor.map(str::to_string),
        });
        let index: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let page = self
            .pages
            .lock()
            .unwrap()
            .get(task_id)
            .and_then(|pages| pages.get(index).cloned())
            .unwrap_or(SubmissionPage {
                submissions: Vec::new(),
                next_cursor: None,
            });
        Ok(page)
    }

    async fn approve_submission(&self, assignment_id: &str) -> PortResult<()> {
        self.calls.lock().unwrap().push(MarketplaceCall::Approve {
            assignment_id: assignment_id.to_string(),
        });
        Ok(())
    }

    async fn reject_submission(&self, assignment_id: &str, feedback: &str) -> PortResult<()> {
        self.calls.lock().unwrap().push(MarketplaceCall::Reject {
            assignment_id: assignment_id.to_string(),
            feedback: feedback.to_string(),
        });
        if self
            .fail_reject_assignments
            .lock()
            .unwrap()
            .contains(assignment_id)
        {
            return Err(scripted_failure("RejectAssignment"));
        }
        Ok(())
    }

    async fn send_bonus(&self, bonus: &BonusPayment) -> PortResult<()> {
        self.calls.lock().unwrap().push(MarketplaceCall::Bonus {
            worker_id: bonus.worker_id.clone(),
            assignment_id: bonus.assignment_id.clone(),
            amount: bonus.amount.clone(),
            token: bonus.unique_request_token.clone(),
        });
        if self
            .fail_bonus_workers
            .lock()
            .unwrap()
            .contains(&bonus.worker_id)
        {
            return Err(scripted_failure("SendBonus"));
        }
        Ok(())
    }

    async fn update_task_expiration(
        &self,
        task_id: &str,
        _expire_at: DateTime<Utc>,
    ) -> PortResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(MarketplaceCall::UpdateExpiration {
                task_id: task_id.to_string(),
            });
        Ok(())
    }
}

//=========================================================================================
// Mock hosting service
//=========================================================================================

pub(crate) struct MockHosting {
    participants: Vec<Participant>,
    unreachable: bool,
    pub pushed_vars: Mutex<Vec<serde_json::Value>>,
}

impl MockHosting {
    pub fn new(participants: Vec<Participant>) -> Self {
        Self {
            participants,
            unreachable: false,
            pushed_vars: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            participants: Vec::new(),
            unreachable: true,
            pushed_vars: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HostingService for MockHosting {
    async fn fetch_session_data(
        &self,
        site: &Site,
        _code: &str,
        participant_labels: &[String],
    ) -> PortResult<SessionData> {
        if self.unreachable {
            return Err(PortError::Unreachable(format!(
                "Could not reach your oTree site at {}",
                site.url
            )));
        }
        let participants: Vec<Participant> = if participant_labels.is_empty() {
            self.participants.clone()
        } else {
            self.participants
                .iter()
                .filter(|p| participant_labels.contains(&p.label))
                .cloned()
                .collect()
        };
        Ok(SessionData {
            config: json!({ "participation_fee": 1.5 }),
            num_participants: participants.len() as i32,
            session_wide_url: "http://host.example.org/join/abc123".to_string(),
            admin_url: "http://host.example.org/admin/abc123".to_string(),
            participants,
            mturk_template_html: String::new(),
        })
    }

    async fn push_session_vars(
        &self,
        _site: &Site,
        _code: &str,
        vars: serde_json::Value,
    ) -> PortResult<()> {
        self.pushed_vars.lock().unwrap().push(vars);
        Ok(())
    }
}
