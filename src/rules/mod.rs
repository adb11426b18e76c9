pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::debug;

use crate::engine::context::RunContext;
use crate::engine::error::CaseError;
use crate::engine::types::{CaseData, CaseDetails, State};
use crate::query::Query;

/// Builds the coarse store query for one run.
pub type QueryFn = fn(&RunContext) -> Query;

/// Decides whether a case matched by the query should get the event now.
/// Must be pure: no I/O, no clock other than `RunContext::today`.
pub type EligibilityFn = fn(&CaseDetails, &RunContext) -> Result<bool, CaseError>;

/// Fixes up a case's current data before a single resubmission.
pub type RepairFn = fn(&mut CaseData);

/// How the event is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Store re-reads the case; safe when other writers may have changed it.
    CaseId,
    /// Submit the data the decision was made on; rejected if the case moved on.
    Snapshot,
}

/// One scheduled advancement task: a query, a rule and an event.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub event_id: &'static str,
    pub query: QueryFn,
    pub eligibility: EligibilityFn,
    pub submit_mode: SubmitMode,
    /// Flag the event sets on the case. While it reads YES the task never
    /// submits for that case again.
    pub idempotency_flag: Option<&'static str>,
    /// State the event moves the case into; its entry checks run first.
    pub target_state: Option<State>,
    pub repair: Option<RepairFn>,
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("event_id", &self.event_id)
            .field("submit_mode", &self.submit_mode)
            .field("idempotency_flag", &self.idempotency_flag)
            .field("target_state", &self.target_state)
            .field("repair", &self.repair.is_some())
            .finish()
    }
}

impl TaskDefinition {
    pub fn build_query(&self, ctx: &RunContext) -> Query {
        (self.query)(ctx)
    }

    /// Eligibility with the idempotency flag checked first, whatever the rule says.
    pub fn is_eligible(&self, case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
        if let Some(flag) = self.idempotency_flag.filter(|f| case.is_yes(f)) {
            debug!(case_id = case.id, flag = flag, "Already actioned, skipping");
            return Ok(false);
        }
        (self.eligibility)(case, ctx)
    }
}

/// Read a date a rule depends on. Missing means "not yet eligible", which is
/// logged and reported as `None`, never as an error.
pub fn required_date(
    case: &CaseDetails,
    field: &str,
    ctx: &RunContext,
) -> Result<Option<NaiveDate>, CaseError> {
    let date = case.date(field, ctx.tz)?;
    if date.is_none() {
        debug!(case_id = case.id, field = field, "Date not set, case not yet eligible");
    }
    Ok(date)
}

/// Registry of available tasks.
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<TaskDefinition>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Create a registry with all built-in tasks registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, task: TaskDefinition) {
        self.tasks.insert(task.name.to_string(), Arc::new(task));
    }

    pub fn get(&self, name: &str) -> Option<Arc<TaskDefinition>> {
        self.tasks.get(name).cloned()
    }

    /// All tasks, sorted by name.
    pub fn list(&self) -> Vec<Arc<TaskDefinition>> {
        let mut entries: Vec<Arc<TaskDefinition>> = self.tasks.values().cloned().collect();
        entries.sort_by_key(|t| t.name);
        entries
    }
}
