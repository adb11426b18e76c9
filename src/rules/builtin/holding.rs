use crate::engine::context::RunContext;
use crate::engine::error::CaseError;
use crate::engine::types::{CaseDetails, State};
use crate::query::{CaseQuery, Query};
use crate::rules::{SubmitMode, TaskDefinition, required_date};

pub const DUE_DATE: &str = "dueDate";

/// Holding cases move on to AwaitingConditionalOrder once the holding
/// period ends. The due date itself counts as reached.
pub fn progress_held_cases() -> TaskDefinition {
    TaskDefinition {
        name: "progress-held-cases",
        description: "Move cases out of Holding once the holding period has ended",
        event_id: "system-progress-held-case",
        query,
        eligibility,
        submit_mode: SubmitMode::CaseId,
        idempotency_flag: None,
        target_state: Some(State::AwaitingConditionalOrder),
        repair: None,
    }
}

fn query(ctx: &RunContext) -> Query {
    CaseQuery::in_state(State::Holding)
        .due_on_or_before(DUE_DATE, ctx.today)
        .build()
}

fn eligibility(case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
    Ok(required_date(case, DUE_DATE, ctx)?.is_some_and(|due| due <= ctx.today))
}
