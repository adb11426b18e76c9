use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures_util::{FutureExt, StreamExt, stream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::context::{RunContext, TimingPolicy};
use crate::engine::error::CaseError;
use crate::engine::types::*;
use crate::query::SearchRequest;
use crate::rules::{SubmitMode, TaskDefinition};
use crate::state;
use crate::store::{CaseStore, CredentialProvider, EventSubmitter, SubmitTarget, SystemCredentials};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Submission concurrency from an override. Anything that is not a positive
/// integer falls back to one per CPU.
fn concurrency_limit(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(num_cpus::get)
        .max(1)
}

/// Outcome of processing one case.
enum CaseOutcome {
    Ineligible,
    Skipped,
    Submitted,
    Failed(String),
}

/// Everything the search returned, decoded or not.
#[derive(Default)]
struct Matched {
    cases: Vec<RawCase>,
    rejected: Vec<CaseError>,
}

struct Processed {
    case_id: i64,
    eligible: bool,
    outcome: CaseOutcome,
}

impl Processed {
    fn new(case_id: i64, eligible: bool, outcome: CaseOutcome) -> Self {
        Self {
            case_id,
            eligible,
            outcome,
        }
    }
}

/// Runs one task end to end: search, evaluate, submit, summarise.
pub struct TaskRunner {
    store: Arc<dyn CaseStore>,
    submitter: Arc<dyn EventSubmitter>,
    credentials: Arc<dyn CredentialProvider>,
    tz: Tz,
    timing: TimingPolicy,
    page_size: usize,
    max_concurrent_submissions: usize,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn CaseStore>,
        submitter: Arc<dyn EventSubmitter>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let max_concurrent_submissions =
            concurrency_limit(std::env::var("CASEFLOW_MAX_CONCURRENT_SUBMISSIONS").ok().as_deref());

        Self {
            store,
            submitter,
            credentials,
            tz: chrono_tz::Europe::London,
            timing: TimingPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
            max_concurrent_submissions,
        }
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.tz = tz;
        self
    }

    pub fn with_timing(mut self, timing: TimingPolicy) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_concurrent_submissions(mut self, n: usize) -> Self {
        self.max_concurrent_submissions = n.max(1);
        self
    }

    pub async fn run(&self, task: &TaskDefinition) -> TaskRun {
        self.run_at(task, Utc::now()).await
    }

    /// Execute a task as of `now`. Never fails: run-level problems end up in
    /// the returned record's status, per-case problems in its `failed` list.
    pub async fn run_at(&self, task: &TaskDefinition, now: DateTime<Utc>) -> TaskRun {
        let run_id = Uuid::new_v4().to_string();
        let mut run = TaskRun::new(&run_id, task.name, Utc::now());
        run.status = RunStatus::Running;

        info!(run_id = %run_id, task = %task.name, event = %task.event_id, "Starting task run");

        let creds = match self.credentials.acquire().await {
            Ok(c) => c,
            Err(e) => {
                error!(run_id = %run_id, task = %task.name, error = %e, "Could not acquire system credentials");
                return Self::abort(run, RunStatus::AbortedOnSearchError, e);
            }
        };

        if let Err(e) = self.store.acquire_lease(&creds, task.name).await {
            return self.abort_on(run, task, e);
        }

        let ctx = RunContext::new(&run_id, task.name, now, self.tz, self.timing.clone());
        let request = SearchRequest::new(task.build_query(&ctx), self.page_size);

        let Matched { cases, rejected } = match self.search_all(&creds, &request).await {
            Ok(matched) => matched,
            Err(e) => {
                self.release(&creds, task).await;
                return self.abort_on(run, task, e);
            }
        };

        run.matched = cases.iter().map(|c| c.id).collect();
        for e in rejected {
            let Some(case_id) = e.case_id() else { continue };
            error!(task = %task.name, case_id = case_id, error = %e, "Skipping case that could not be deserialized");
            run.matched.push(case_id);
            run.failed.push(CaseFailure {
                case_id,
                error: e.to_string(),
            });
        }
        info!(run_id = %run_id, task = %task.name, matched = run.matched.len(), today = %ctx.today, "Search complete");

        let results: Vec<Processed> = stream::iter(cases)
            .map(|raw| self.process_guarded(&creds, task, &ctx, raw))
            .buffer_unordered(self.max_concurrent_submissions)
            .collect()
            .await;

        for processed in results {
            if processed.eligible {
                run.eligible.push(processed.case_id);
            }
            match processed.outcome {
                CaseOutcome::Submitted => run.succeeded.push(processed.case_id),
                CaseOutcome::Ineligible | CaseOutcome::Skipped => run.skipped.push(processed.case_id),
                CaseOutcome::Failed(error) => run.failed.push(CaseFailure {
                    case_id: processed.case_id,
                    error,
                }),
            }
        }

        self.release(&creds, task).await;

        run.status = RunStatus::Completed;
        run.finished = Some(Utc::now());

        info!(
            run_id = %run_id,
            task = %task.name,
            matched = run.matched.len(),
            eligible = run.eligible.len(),
            succeeded = run.succeeded.len(),
            failed = run.failed.len(),
            skipped = run.skipped.len(),
            "Task run complete"
        );

        run
    }

    /// Drain every page before any case is evaluated.
    ///
    /// Paging stops on an empty page, when the store says there is nothing
    /// more, or once the reported total has been fetched. A short page alone
    /// never ends it.
    async fn search_all(
        &self,
        creds: &SystemCredentials,
        request: &SearchRequest,
    ) -> Result<Matched, CaseError> {
        let mut matched = Matched::default();
        let mut seen = HashSet::new();
        let mut next = request.clone();

        loop {
            let page = self.store.search(creds, &next).await?;
            let cursor = page.last_id();
            let before = seen.len();

            for case in page.cases {
                if seen.insert(case.id) {
                    matched.cases.push(case);
                }
            }
            for e in page.rejected {
                if e.case_id().is_some_and(|id| seen.insert(id)) {
                    matched.rejected.push(e);
                }
            }

            let fetched = seen.len();
            let all_fetched = page.total.is_some_and(|total| fetched as u64 >= total);
            let Some(cursor) = cursor.filter(|_| page.has_more && !all_fetched) else {
                break;
            };
            if fetched == before {
                warn!(cursor = cursor, fetched = fetched, "Search page repeated earlier cases, stopping");
                break;
            }

            debug!(cursor = cursor, fetched = fetched, total = ?page.total, "Fetching next page");
            next = request.after(cursor);
        }

        Ok(matched)
    }

    /// Process one case, turning a panicking rule into a case failure.
    async fn process_guarded(
        &self,
        creds: &SystemCredentials,
        task: &TaskDefinition,
        ctx: &RunContext,
        raw: RawCase,
    ) -> Processed {
        let case_id = raw.id;
        match AssertUnwindSafe(self.process_case(creds, task, ctx, raw))
            .catch_unwind()
            .await
        {
            Ok(processed) => processed,
            Err(_) => {
                error!(task = %task.name, case_id = case_id, "Case processing panicked");
                Processed::new(case_id, false, CaseOutcome::Failed("case processing panicked".to_string()))
            }
        }
    }

    async fn process_case(
        &self,
        creds: &SystemCredentials,
        task: &TaskDefinition,
        ctx: &RunContext,
        raw: RawCase,
    ) -> Processed {
        let case_id = raw.id;

        let case = match CaseDetails::try_from(raw) {
            Ok(case) => case,
            Err(e) => {
                error!(task = %task.name, case_id = case_id, error = %e, "Skipping case that could not be deserialized");
                return Processed::new(case_id, false, CaseOutcome::Failed(e.to_string()));
            }
        };

        match task.is_eligible(&case, ctx) {
            Ok(true) => {}
            Ok(false) => {
                debug!(task = %task.name, case_id = case_id, "Case not eligible");
                return Processed::new(case_id, false, CaseOutcome::Ineligible);
            }
            Err(e) => {
                error!(task = %task.name, case_id = case_id, error = %e, "Eligibility check failed");
                return Processed::new(case_id, false, CaseOutcome::Failed(e.to_string()));
            }
        }

        if let Some(target) = task.target_state {
            let defects = state::validate(target, &case);
            if !defects.is_empty() {
                warn!(
                    task = %task.name,
                    case_id = case_id,
                    target = %target,
                    defects = ?defects,
                    "Case cannot enter target state, skipping"
                );
                return Processed::new(case_id, true, CaseOutcome::Skipped);
            }
        }

        let target = match task.submit_mode {
            SubmitMode::CaseId => SubmitTarget::CaseId(case.id),
            SubmitMode::Snapshot => SubmitTarget::Snapshot(&case),
        };

        let result = match self.submitter.submit(creds, target, task.event_id).await {
            Err(e @ CaseError::Submit { .. }) if task.repair.is_some() => {
                warn!(task = %task.name, case_id = case_id, error = %e, "Submission rejected, repairing and retrying once");
                self.repair_and_resubmit(creds, task, case_id).await
            }
            other => other,
        };

        match result {
            Ok(_) => {
                info!(task = %task.name, case_id = case_id, event = %task.event_id, "Submitted event");
                Processed::new(case_id, true, CaseOutcome::Submitted)
            }
            Err(e) => {
                error!(task = %task.name, case_id = case_id, event = %task.event_id, error = %e, "Event submission failed");
                Processed::new(case_id, true, CaseOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Single-shot retry: re-read the case, repair its data, submit the result.
    async fn repair_and_resubmit(
        &self,
        creds: &SystemCredentials,
        task: &TaskDefinition,
        case_id: i64,
    ) -> Result<RawCase, CaseError> {
        let Some(repair) = task.repair else {
            return Err(CaseError::submit(case_id, task.event_id, "no repair defined"));
        };

        let current = self.store.fetch(creds, case_id).await.map_err(|e| {
            CaseError::submit(case_id, task.event_id, format!("could not re-read case for repair: {}", e))
        })?;
        let mut case = CaseDetails::try_from(current)?;
        repair(&mut case.data);

        self.submitter
            .submit(creds, SubmitTarget::Snapshot(&case), task.event_id)
            .await
    }

    async fn release(&self, creds: &SystemCredentials, task: &TaskDefinition) {
        if let Err(e) = self.store.release_lease(creds, task.name).await {
            warn!(task = %task.name, error = %e, "Failed to release task lease");
        }
    }

    fn abort_on(&self, run: TaskRun, task: &TaskDefinition, e: CaseError) -> TaskRun {
        match e {
            CaseError::Conflict(_) => {
                info!(run_id = %run.run_id, task = %task.name, reason = %e, "Task already running elsewhere, stopping");
                Self::abort(run, RunStatus::AbortedOnConflict, e)
            }
            _ => {
                error!(run_id = %run.run_id, task = %task.name, error = %e, "Case search failed, stopping");
                Self::abort(run, RunStatus::AbortedOnSearchError, e)
            }
        }
    }

    fn abort(mut run: TaskRun, status: RunStatus, e: CaseError) -> TaskRun {
        run.status = status;
        run.abort_reason = Some(e.to_string());
        run.finished = Some(Utc::now());
        run
    }
}
