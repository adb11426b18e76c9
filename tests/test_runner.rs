//! End-to-end tests for the task runner against in-memory and scripted stores.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use caseflow::engine::TaskRunner;
use caseflow::engine::error::CaseError;
use caseflow::engine::types::*;
use caseflow::query::{CaseQuery, SearchRequest};
use caseflow::rules::builtin::payment::{PAYMENT_TOTAL, successful_total};
use caseflow::rules::{SubmitMode, TaskDefinition, TaskRegistry};
use caseflow::store::memory::{EventEffect, MemoryCaseStore};
use caseflow::store::{
    CaseStore, CredentialProvider, EventSubmitter, SearchPage, StaticCredentials, SubmitTarget,
    SystemCredentials,
};
use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use serde_json::json;

const JOINT_TASK: &str = "remind-awaiting-joint-final-order";
const JOINT_EVENT: &str = "system-remind-applicants-awaiting-joint-final-order";
const JOINT_FLAG: &str = "applicantsRemindedAwaitingJointFinalOrder";

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
}

fn now() -> DateTime<Utc> {
    Utc.from_utc_datetime(&today().and_hms_opt(11, 0, 0).unwrap())
}

fn ago(days: u64) -> String {
    (today() - Days::new(days)).format("%Y-%m-%d").to_string()
}

fn task(name: &str) -> Arc<TaskDefinition> {
    TaskRegistry::with_builtins().get(name).unwrap()
}

fn credentials() -> Arc<StaticCredentials> {
    Arc::new(StaticCredentials::new("system-user", "service"))
}

/// Memory store with every built-in event's effect registered.
fn memory_store(cases: Vec<RawCase>) -> Arc<MemoryCaseStore> {
    let tasks = TaskRegistry::with_builtins().list();
    Arc::new(MemoryCaseStore::from_cases(cases).with_task_effects(&tasks))
}

fn memory_runner(store: &Arc<MemoryCaseStore>) -> TaskRunner {
    TaskRunner::new(store.clone(), store.clone(), credentials()).with_max_concurrent_submissions(4)
}

fn joint_case(id: i64, submitted: String) -> RawCase {
    RawCase::new(
        id,
        State::AwaitingJointFinalOrder,
        json!({ "dateFinalOrderSubmitted": submitted }),
    )
}

// ---------------------------------------------------------------------------
// Scripted doubles
// ---------------------------------------------------------------------------

/// Returns its cases regardless of the query, paged by id.
struct ScriptedStore {
    cases: Vec<RawCase>,
    fail_search: bool,
    /// Serve at most this many cases per page, like a remote store that
    /// ignores the requested size, and only signal the end with an empty page.
    page_cap: Option<usize>,
    report_total: bool,
    /// Ids reported back as records that failed to decode.
    undecodable: HashSet<i64>,
    searches: AtomicUsize,
    releases: AtomicUsize,
}

impl ScriptedStore {
    fn new(cases: Vec<RawCase>) -> Self {
        Self {
            cases,
            fail_search: false,
            page_cap: None,
            report_total: false,
            undecodable: HashSet::new(),
            searches: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail_search: true,
            ..Self::new(Vec::new())
        }
    }

    fn capped(cases: Vec<RawCase>, cap: usize, report_total: bool) -> Self {
        Self {
            page_cap: Some(cap),
            report_total,
            ..Self::new(cases)
        }
    }

    fn with_undecodable(mut self, ids: &[i64]) -> Self {
        self.undecodable = ids.iter().copied().collect();
        self
    }
}

#[async_trait]
impl CaseStore for ScriptedStore {
    async fn acquire_lease(&self, _creds: &SystemCredentials, _task: &str) -> Result<(), CaseError> {
        Ok(())
    }

    async fn release_lease(&self, _creds: &SystemCredentials, _task: &str) -> Result<(), CaseError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search(
        &self,
        _creds: &SystemCredentials,
        request: &SearchRequest,
    ) -> Result<SearchPage, CaseError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if self.fail_search {
            return Err(CaseError::Search("store unavailable".to_string()));
        }
        let after = request.cursor().unwrap_or(i64::MIN);
        let rest: Vec<RawCase> = self.cases.iter().filter(|c| c.id > after).cloned().collect();
        let size = self.page_cap.map_or(request.size, |cap| cap.min(request.size));
        let has_more = match self.page_cap {
            Some(_) => !rest.is_empty(),
            None => rest.len() > request.size,
        };

        let mut page = SearchPage {
            has_more,
            total: self.report_total.then_some(self.cases.len() as u64),
            ..SearchPage::default()
        };
        for case in rest.into_iter().take(size) {
            if self.undecodable.contains(&case.id) {
                page.rejected.push(CaseError::deserialization(
                    case.id,
                    "state: invalid type: null, expected a string",
                ));
            } else {
                page.cases.push(case);
            }
        }
        Ok(page)
    }

    async fn fetch(&self, _creds: &SystemCredentials, case_id: i64) -> Result<RawCase, CaseError> {
        self.cases
            .iter()
            .find(|c| c.id == case_id)
            .cloned()
            .ok_or_else(|| CaseError::Search(format!("case {} not found", case_id)))
    }
}

/// Accepts every event except for the listed cases.
#[derive(Default)]
struct RecordingSubmitter {
    reject: HashSet<i64>,
    submitted: std::sync::Mutex<Vec<(i64, String)>>,
}

impl RecordingSubmitter {
    fn rejecting(ids: &[i64]) -> Self {
        Self {
            reject: ids.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn submitted(&self) -> Vec<(i64, String)> {
        let mut all = self.submitted.lock().unwrap().clone();
        all.sort();
        all
    }
}

#[async_trait]
impl EventSubmitter for RecordingSubmitter {
    async fn submit(
        &self,
        _creds: &SystemCredentials,
        target: SubmitTarget<'_>,
        event_id: &str,
    ) -> Result<RawCase, CaseError> {
        let id = target.case_id();
        if self.reject.contains(&id) {
            return Err(CaseError::submit(id, event_id, "HTTP 422: rejected"));
        }
        self.submitted.lock().unwrap().push((id, event_id.to_string()));
        Ok(RawCase::new(id, State::AwaitingJointFinalOrder, json!({})))
    }
}

/// Stands in for an environment without system tokens.
struct MissingCredentials;

#[async_trait]
impl CredentialProvider for MissingCredentials {
    async fn acquire(&self) -> Result<SystemCredentials, CaseError> {
        Err(CaseError::Credentials("CASEFLOW_SYSTEM_TOKEN is not set".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Joint final order reminder, end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn joint_reminder_submits_once_and_sets_flag() {
    let store = memory_store(vec![joint_case(1001, ago(15))]);
    let runner = memory_runner(&store);

    let run = runner.run_at(&task(JOINT_TASK), now()).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.matched, vec![1001]);
    assert_eq!(run.succeeded, vec![1001]);

    let submissions = store.submissions().await;
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].event_id, JOINT_EVENT);
    assert!(submissions[0].accepted);

    let stored = store.get(1001).await.unwrap();
    assert_eq!(stored.data[JOINT_FLAG], json!("Yes"));
}

#[tokio::test]
async fn joint_reminder_due_today_with_time_of_day() {
    let submitted = format!("{}T10:30:00", ago(14));
    let store = memory_store(vec![joint_case(1001, submitted)]);

    let run = memory_runner(&store).run_at(&task(JOINT_TASK), now()).await;

    assert_eq!(run.matched, vec![1001]);
    assert_eq!(run.succeeded, vec![1001]);
    assert_eq!(store.get(1001).await.unwrap().data[JOINT_FLAG], json!("Yes"));
}

#[tokio::test]
async fn joint_reminder_not_repeated() {
    let store = memory_store(vec![joint_case(1001, ago(15))]);
    let runner = memory_runner(&store);

    runner.run_at(&task(JOINT_TASK), now()).await;
    let second = runner.run_at(&task(JOINT_TASK), now()).await;

    assert_eq!(second.status, RunStatus::Completed);
    assert!(second.matched.is_empty());
    assert_eq!(store.submissions().await.len(), 1);
}

#[tokio::test]
async fn joint_reminder_skips_flagged_case() {
    let mut case = joint_case(1001, ago(15));
    case.data[JOINT_FLAG] = json!("Yes");
    let store = memory_store(vec![case]);

    let run = memory_runner(&store).run_at(&task(JOINT_TASK), now()).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.succeeded.is_empty());
    assert!(store.submissions().await.is_empty());
}

#[tokio::test]
async fn flagged_case_returned_by_store_is_still_skipped() {
    // A store that ignores the query must not lead to a second reminder.
    let case = RawCase::new(
        7,
        State::AwaitingJointFinalOrder,
        json!({ "dateFinalOrderSubmitted": ago(20), JOINT_FLAG: "Yes" }),
    );
    let store = Arc::new(ScriptedStore::new(vec![case]));
    let submitter = Arc::new(RecordingSubmitter::default());

    let run = TaskRunner::new(store, submitter.clone(), credentials())
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.skipped, vec![7]);
    assert!(submitter.submitted().is_empty());
}

#[tokio::test]
async fn joint_reminder_waits_for_offset() {
    let store = memory_store(vec![joint_case(1, ago(13)), joint_case(2, ago(14))]);
    let run = memory_runner(&store).run_at(&task(JOINT_TASK), now()).await;

    assert_eq!(run.succeeded, vec![2]);
    assert_eq!(store.get(1).await.unwrap().data.get(JOINT_FLAG), None);
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_bad_case_does_not_stop_the_others() {
    let mut cases: Vec<RawCase> = (1..=5).map(|id| joint_case(id, ago(15))).collect();
    cases[2].data = json!("not an object");

    let store = Arc::new(ScriptedStore::new(cases));
    let submitter = Arc::new(RecordingSubmitter::default());
    let run = TaskRunner::new(store, submitter.clone(), credentials())
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.failed_ids(), vec![3]);
    assert!(run.failed[0].error.contains("could not be deserialized"));

    let mut succeeded = run.succeeded.clone();
    succeeded.sort();
    assert_eq!(succeeded, vec![1, 2, 4, 5]);
    assert_eq!(submitter.submitted().len(), 4);
}

#[tokio::test]
async fn rejected_submission_is_a_case_failure() {
    let cases: Vec<RawCase> = (1..=3).map(|id| joint_case(id, ago(15))).collect();
    let store = Arc::new(ScriptedStore::new(cases));
    let submitter = Arc::new(RecordingSubmitter::rejecting(&[2]));

    let run = TaskRunner::new(store, submitter.clone(), credentials())
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.failed_ids(), vec![2]);
    assert!(run.failed[0].error.contains("HTTP 422"));
    assert_eq!(
        submitter.submitted(),
        vec![(1, JOINT_EVENT.to_string()), (3, JOINT_EVENT.to_string())]
    );
}

#[tokio::test]
async fn bad_date_fails_only_that_case() {
    let cases = vec![
        joint_case(1, ago(15)),
        joint_case(2, "fifteen days ago".to_string()),
    ];
    let store = Arc::new(ScriptedStore::new(cases));
    let submitter = Arc::new(RecordingSubmitter::default());

    let run = TaskRunner::new(store, submitter.clone(), credentials())
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.succeeded, vec![1]);
    assert_eq!(run.failed_ids(), vec![2]);
}

#[tokio::test]
async fn search_failure_aborts_without_submitting() {
    let store = Arc::new(ScriptedStore::failing());
    let submitter = Arc::new(RecordingSubmitter::default());

    let run = TaskRunner::new(store.clone(), submitter.clone(), credentials())
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.status, RunStatus::AbortedOnSearchError);
    assert!(run.abort_reason.unwrap().contains("store unavailable"));
    assert!(run.matched.is_empty());
    assert!(submitter.submitted().is_empty());
    assert_eq!(store.releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_credentials_abort_before_searching() {
    let store = Arc::new(ScriptedStore::new(vec![joint_case(1001, ago(15))]));
    let submitter = Arc::new(RecordingSubmitter::default());

    let run = TaskRunner::new(store.clone(), submitter.clone(), Arc::new(MissingCredentials))
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.status, RunStatus::AbortedOnSearchError);
    let reason = run.abort_reason.unwrap();
    assert!(reason.contains("credentials unavailable"));
    assert!(!reason.contains("case search failed"));
    assert_eq!(store.searches.load(Ordering::SeqCst), 0);
    assert!(submitter.submitted().is_empty());
}

#[tokio::test]
async fn held_lease_aborts_on_conflict() {
    let store = memory_store(vec![joint_case(1001, ago(15))]);
    store.hold_lease(JOINT_TASK).await;

    let run = memory_runner(&store).run_at(&task(JOINT_TASK), now()).await;

    assert_eq!(run.status, RunStatus::AbortedOnConflict);
    assert!(store.submissions().await.is_empty());
    assert!(store.lease_held(JOINT_TASK).await);
}

#[tokio::test]
async fn lease_released_after_run() {
    let store = memory_store(vec![joint_case(1001, ago(15))]);
    memory_runner(&store).run_at(&task(JOINT_TASK), now()).await;
    assert!(!store.lease_held(JOINT_TASK).await);
}

fn panics_on_two(case: &CaseDetails, _ctx: &caseflow::engine::RunContext) -> Result<bool, CaseError> {
    if case.id == 2 {
        panic!("rule blew up");
    }
    Ok(true)
}

#[tokio::test]
async fn panicking_rule_fails_only_that_case() {
    let custom = TaskDefinition {
        name: "custom",
        description: "test task",
        event_id: "system-custom",
        query: |_| CaseQuery::in_state(State::Holding).build(),
        eligibility: panics_on_two,
        submit_mode: SubmitMode::CaseId,
        idempotency_flag: None,
        target_state: None,
        repair: None,
    };
    let cases: Vec<RawCase> = (1..=3).map(|id| RawCase::new(id, State::Holding, json!({}))).collect();
    let store = Arc::new(ScriptedStore::new(cases));
    let submitter = Arc::new(RecordingSubmitter::default());

    let run = TaskRunner::new(store, submitter.clone(), credentials())
        .run_at(&custom, now())
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.failed_ids(), vec![2]);
    assert_eq!(submitter.submitted().len(), 2);
}

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drains_every_page_before_processing() {
    let cases: Vec<RawCase> = (1..=25).map(|id| joint_case(id, ago(30))).collect();
    let store = memory_store(cases);

    let run = memory_runner(&store)
        .with_page_size(10)
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.matched, (1..=25).collect::<Vec<i64>>());
    assert_eq!(run.succeeded.len(), 25);
    assert_eq!(store.submissions().await.len(), 25);
}

#[tokio::test]
async fn scripted_paging_stops_when_exhausted() {
    let cases: Vec<RawCase> = (1..=7).map(|id| joint_case(id, ago(30))).collect();
    let store = Arc::new(ScriptedStore::new(cases));
    let submitter = Arc::new(RecordingSubmitter::default());

    let run = TaskRunner::new(store.clone(), submitter, credentials())
        .with_page_size(3)
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.matched.len(), 7);
    assert_eq!(store.searches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn short_pages_do_not_end_paging_before_total() {
    let cases: Vec<RawCase> = (1..=7).map(|id| joint_case(id, ago(30))).collect();
    let store = Arc::new(ScriptedStore::capped(cases, 2, true));
    let submitter = Arc::new(RecordingSubmitter::default());

    let run = TaskRunner::new(store.clone(), submitter.clone(), credentials())
        .with_page_size(5)
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.matched, (1..=7).collect::<Vec<i64>>());
    assert_eq!(submitter.submitted().len(), 7);
    // 2 + 2 + 2 + 1 reaches the reported total, no trailing empty request
    assert_eq!(store.searches.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn capped_pages_without_total_end_on_empty_page() {
    let cases: Vec<RawCase> = (1..=5).map(|id| joint_case(id, ago(30))).collect();
    let store = Arc::new(ScriptedStore::capped(cases, 2, false));
    let submitter = Arc::new(RecordingSubmitter::default());

    let run = TaskRunner::new(store.clone(), submitter, credentials())
        .with_page_size(10)
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.matched, (1..=5).collect::<Vec<i64>>());
    assert_eq!(store.searches.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn undecodable_record_fails_only_that_case() {
    let cases: Vec<RawCase> = (1..=3).map(|id| joint_case(id, ago(30))).collect();
    let store = Arc::new(ScriptedStore::new(cases).with_undecodable(&[2]));
    let submitter = Arc::new(RecordingSubmitter::default());

    let run = TaskRunner::new(store, submitter.clone(), credentials())
        .run_at(&task(JOINT_TASK), now())
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    let mut matched = run.matched.clone();
    matched.sort();
    assert_eq!(matched, vec![1, 2, 3]);
    assert_eq!(run.failed_ids(), vec![2]);
    assert!(run.failed[0].error.contains("could not be deserialized"));
    assert_eq!(
        submitter.submitted(),
        vec![(1, JOINT_EVENT.to_string()), (3, JOINT_EVENT.to_string())]
    );
}

#[tokio::test]
async fn zero_concurrency_still_completes() {
    let store = memory_store(vec![joint_case(1001, ago(15)), joint_case(1002, ago(20))]);
    let runner = TaskRunner::new(store.clone(), store.clone(), credentials())
        .with_max_concurrent_submissions(0);

    let run = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        runner.run_at(&task(JOINT_TASK), now()),
    )
    .await
    .expect("run should not hang");

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.succeeded.len(), 2);
    assert!(!store.lease_held(JOINT_TASK).await);
}

// ---------------------------------------------------------------------------
// Target-state checks, snapshots and repair
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_target_state_skips_case() {
    let incomplete = RawCase::new(1, State::Holding, json!({ "dueDate": ago(1) }));
    let complete = RawCase::new(
        2,
        State::Holding,
        json!({ "dueDate": ago(1), "issueDate": ago(140) }),
    );
    let store = memory_store(vec![incomplete, complete]);

    let run = memory_runner(&store)
        .run_at(&task("progress-held-cases"), now())
        .await;

    let mut eligible = run.eligible.clone();
    eligible.sort();
    assert_eq!(eligible, vec![1, 2]);
    assert_eq!(run.skipped, vec![1]);
    assert_eq!(run.succeeded, vec![2]);
    assert_eq!(store.get(1).await.unwrap().state, "Holding");
    assert_eq!(store.get(2).await.unwrap().state, "AwaitingConditionalOrder");
}

#[tokio::test]
async fn stale_snapshot_is_rejected() {
    let read = RawCase::new(
        5,
        State::ConditionalOrderPronounced,
        json!({ "dateFinalOrderEligibleFrom": ago(0), "coGrantedDate": ago(43) }),
    );
    let mut current = read.clone();
    current.version = Some(2);

    let store = Arc::new(ScriptedStore::new(vec![read]));
    let submitter = memory_store(vec![current]);

    let run = TaskRunner::new(store, submitter.clone(), credentials())
        .run_at(&task("progress-to-awaiting-final-order"), now())
        .await;

    assert_eq!(run.failed_ids(), vec![5]);
    assert!(run.failed[0].error.contains("modified since it was read"));
    assert_eq!(
        submitter.get(5).await.unwrap().state,
        "ConditionalOrderPronounced"
    );
}

fn paid_case(total: i64) -> RawCase {
    RawCase::new(
        42,
        State::AwaitingPayment,
        json!({
            "applicant1FirstName": "Sam",
            "applicant1LastName": "Jones",
            "marriageDate": "2015-06-20",
            "applicant1StatementOfTruth": "Yes",
            "applicant1PrayerConfirmed": "Yes",
            "applicationPayments": [
                { "id": "1", "value": { "status": "failed", "amount": 59300 } },
                { "id": "2", "value": { "status": "success", "amount": 59300 } }
            ],
            PAYMENT_TOTAL: total
        }),
    )
}

fn totals_agree(case: &RawCase) -> Result<(), String> {
    let data = case.data.as_object().ok_or("no data")?;
    let recorded = data.get(PAYMENT_TOTAL).and_then(|v| v.as_i64());
    if recorded == Some(successful_total(data)) {
        Ok(())
    } else {
        Err(format!("payment total {:?} does not match payments", recorded))
    }
}

fn always_reject(_case: &RawCase) -> Result<(), String> {
    Err("event not allowed".to_string())
}

fn payment_store(case: RawCase, guard: caseflow::store::memory::EventGuard) -> Arc<MemoryCaseStore> {
    Arc::new(MemoryCaseStore::from_cases(vec![case]).with_effect(
        "system-progress-paid-case",
        EventEffect::new()
            .moving_to(State::Submitted)
            .guarded_by(guard),
    ))
}

#[tokio::test]
async fn rejected_payment_is_repaired_and_resubmitted_once() {
    let store = payment_store(paid_case(118600), totals_agree);

    let run = memory_runner(&store)
        .run_at(&task("progress-paid-cases"), now())
        .await;

    assert_eq!(run.succeeded, vec![42]);
    let attempts: Vec<bool> = store.submissions().await.iter().map(|s| s.accepted).collect();
    assert_eq!(attempts, vec![false, true]);

    let stored = store.get(42).await.unwrap();
    assert_eq!(stored.state, "Submitted");
    assert_eq!(stored.data[PAYMENT_TOTAL], json!(59300));
}

#[tokio::test]
async fn repair_is_not_retried_twice() {
    let store = payment_store(paid_case(59300), always_reject);

    let run = memory_runner(&store)
        .run_at(&task("progress-paid-cases"), now())
        .await;

    assert_eq!(run.failed_ids(), vec![42]);
    assert_eq!(store.submissions().await.len(), 2);
    assert_eq!(store.get(42).await.unwrap().state, "AwaitingPayment");
}

#[tokio::test]
async fn consistent_payment_submits_first_time() {
    let store = payment_store(paid_case(59300), totals_agree);

    let run = memory_runner(&store)
        .run_at(&task("progress-paid-cases"), now())
        .await;

    assert_eq!(run.succeeded, vec![42]);
    assert_eq!(store.submissions().await.len(), 1);
    assert!(store.submissions().await[0].snapshot);
}
