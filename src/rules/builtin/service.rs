use crate::engine::context::RunContext;
use crate::engine::error::CaseError;
use crate::engine::types::{CaseDetails, State};
use crate::query::{CaseQuery, Query, data_field, exists, range};
use crate::rules::{SubmitMode, TaskDefinition, required_date};

pub const DUE_DATE: &str = "dueDate";
pub const DATE_AOS_SUBMITTED: &str = "dateAosSubmitted";

/// The respondent's acknowledgement is overdue once its due date is strictly
/// in the past. A due date of today still leaves the respondent today.
pub fn progress_to_aos_overdue() -> TaskDefinition {
    TaskDefinition {
        name: "progress-to-aos-overdue",
        description: "Move cases to AosOverdue when the acknowledgement due date has passed",
        event_id: "system-progress-to-aos-overdue",
        query,
        eligibility,
        submit_mode: SubmitMode::CaseId,
        idempotency_flag: None,
        target_state: Some(State::AosOverdue),
        repair: None,
    }
}

fn query(ctx: &RunContext) -> Query {
    CaseQuery::in_states(&[State::AwaitingAos, State::AosDrafted])
        .filter(range(&data_field(DUE_DATE)).lt(ctx.today).build())
        .must_not(exists(&data_field(DATE_AOS_SUBMITTED)))
        .build()
}

fn eligibility(case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
    if case.text(DATE_AOS_SUBMITTED).is_some() {
        return Ok(false);
    }
    Ok(required_date(case, DUE_DATE, ctx)?.is_some_and(|due| due < ctx.today))
}
