use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::engine::error::CaseError;
use crate::engine::types::{RawCase, State, YES};
use crate::query::SearchRequest;
use crate::rules::TaskDefinition;
use crate::store::{CaseStore, EventSubmitter, SearchPage, SubmitTarget, SystemCredentials};

/// Store-side check that can reject an event for the case it is applied to.
pub type EventGuard = fn(&RawCase) -> Result<(), String>;

/// What the store does to a case when an event is accepted.
#[derive(Debug, Clone, Default)]
pub struct EventEffect {
    pub to_state: Option<State>,
    pub set_flags: Vec<String>,
    pub guard: Option<EventGuard>,
}

impl EventEffect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn moving_to(mut self, state: State) -> Self {
        self.to_state = Some(state);
        self
    }

    pub fn setting_flag(mut self, field: &str) -> Self {
        self.set_flags.push(field.to_string());
        self
    }

    pub fn guarded_by(mut self, guard: EventGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// What the remote store does for a task's event: set its idempotency
    /// flag and move the case to its target state.
    pub fn for_task(task: &TaskDefinition) -> Self {
        let mut effect = Self::new();
        if let Some(flag) = task.idempotency_flag {
            effect = effect.setting_flag(flag);
        }
        if let Some(state) = task.target_state {
            effect = effect.moving_to(state);
        }
        effect
    }
}

/// One submission attempt seen by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub case_id: i64,
    pub event_id: String,
    pub snapshot: bool,
    pub accepted: bool,
}

/// In-memory case store. Applies the same query semantics as the remote
/// store and holds state only for the lifetime of the instance.
pub struct MemoryCaseStore {
    cases: RwLock<BTreeMap<i64, RawCase>>,
    leases: Mutex<HashSet<String>>,
    effects: HashMap<String, EventEffect>,
    submissions: Mutex<Vec<Submission>>,
}

impl Default for MemoryCaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::from_cases(Vec::new())
    }

    pub fn from_cases(cases: Vec<RawCase>) -> Self {
        Self {
            cases: RwLock::new(cases.into_iter().map(|c| (c.id, c)).collect()),
            leases: Mutex::new(HashSet::new()),
            effects: HashMap::new(),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Register the store-side effect of an event.
    pub fn with_effect(mut self, event_id: &str, effect: EventEffect) -> Self {
        self.effects.insert(event_id.to_string(), effect);
        self
    }

    /// Register `EventEffect::for_task` for every task's event.
    pub fn with_task_effects(self, tasks: &[Arc<TaskDefinition>]) -> Self {
        tasks.iter().fold(self, |store, task| {
            store.with_effect(task.event_id, EventEffect::for_task(task))
        })
    }

    pub async fn insert(&self, case: RawCase) {
        self.cases.write().await.insert(case.id, case);
    }

    pub async fn get(&self, case_id: i64) -> Option<RawCase> {
        self.cases.read().await.get(&case_id).cloned()
    }

    pub async fn all_cases(&self) -> Vec<RawCase> {
        self.cases.read().await.values().cloned().collect()
    }

    pub async fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().await.clone()
    }

    /// Hold a task's lease as if another run had it.
    pub async fn hold_lease(&self, task: &str) {
        self.leases.lock().await.insert(task.to_string());
    }

    pub async fn lease_held(&self, task: &str) -> bool {
        self.leases.lock().await.contains(task)
    }

    fn apply(&self, case: &mut RawCase, event_id: &str) -> Result<(), String> {
        let Some(effect) = self.effects.get(event_id) else {
            return Ok(());
        };

        if let Some(guard) = effect.guard {
            guard(case)?;
        }

        if !effect.set_flags.is_empty() {
            if case.data.is_null() {
                case.data = serde_json::Value::Object(Default::default());
            }
            let data = case
                .data
                .as_object_mut()
                .ok_or_else(|| "case data is not an object".to_string())?;
            for flag in &effect.set_flags {
                data.insert(flag.clone(), serde_json::Value::String(YES.to_string()));
            }
        }

        if let Some(state) = effect.to_state {
            case.state = state.to_string();
        }
        Ok(())
    }

    async fn record(&self, target: &SubmitTarget<'_>, event_id: &str, accepted: bool) {
        self.submissions.lock().await.push(Submission {
            case_id: target.case_id(),
            event_id: event_id.to_string(),
            snapshot: matches!(target, SubmitTarget::Snapshot(_)),
            accepted,
        });
    }

    fn apply_to_stored(
        &self,
        stored: &mut RawCase,
        target: &SubmitTarget<'_>,
        event_id: &str,
    ) -> Result<RawCase, String> {
        let mut working = match target {
            SubmitTarget::CaseId(_) => stored.clone(),
            SubmitTarget::Snapshot(snapshot) => {
                if snapshot.version != stored.version {
                    return Err(format!(
                        "case was modified since it was read (snapshot version {:?}, current {:?})",
                        snapshot.version, stored.version
                    ));
                }
                RawCase::from((*snapshot).clone())
            }
        };

        self.apply(&mut working, event_id)?;
        working.version = Some(stored.version.unwrap_or(0) + 1);
        *stored = working.clone();
        Ok(working)
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn acquire_lease(&self, _creds: &SystemCredentials, task: &str) -> Result<(), CaseError> {
        let mut leases = self.leases.lock().await;
        if !leases.insert(task.to_string()) {
            return Err(CaseError::Conflict(format!("task '{}' is already running", task)));
        }
        Ok(())
    }

    async fn release_lease(&self, _creds: &SystemCredentials, task: &str) -> Result<(), CaseError> {
        self.leases.lock().await.remove(task);
        Ok(())
    }

    async fn search(
        &self,
        _creds: &SystemCredentials,
        request: &SearchRequest,
    ) -> Result<SearchPage, CaseError> {
        let cases = self.cases.read().await;
        let after = request.cursor().unwrap_or(i64::MIN);

        let mut matching = cases
            .range(after.saturating_add(1)..)
            .map(|(_, c)| c)
            .filter(|c| request.query.matches(c));

        let page: Vec<RawCase> = matching.by_ref().take(request.size).cloned().collect();
        let has_more = matching.next().is_some();
        let total = cases.values().filter(|c| request.query.matches(c)).count() as u64;

        Ok(SearchPage {
            cases: page,
            total: Some(total),
            has_more,
            ..SearchPage::default()
        })
    }

    async fn fetch(&self, _creds: &SystemCredentials, case_id: i64) -> Result<RawCase, CaseError> {
        self.get(case_id)
            .await
            .ok_or_else(|| CaseError::Search(format!("case {} not found", case_id)))
    }
}

#[async_trait]
impl EventSubmitter for MemoryCaseStore {
    async fn submit(
        &self,
        _creds: &SystemCredentials,
        target: SubmitTarget<'_>,
        event_id: &str,
    ) -> Result<RawCase, CaseError> {
        let case_id = target.case_id();
        let result = {
            let mut cases = self.cases.write().await;
            match cases.get_mut(&case_id) {
                None => Err(format!("case {} not found", case_id)),
                Some(stored) => self.apply_to_stored(stored, &target, event_id),
            }
        };

        self.record(&target, event_id, result.is_ok()).await;
        result.map_err(|reason| CaseError::submit(case_id, event_id, reason))
    }
}
