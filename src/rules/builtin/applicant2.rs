use crate::engine::context::{RunContext, minus_days};
use crate::engine::error::CaseError;
use crate::engine::types::{CaseDetails, State};
use crate::query::{CaseQuery, Query, data_field, exists, range};
use crate::rules::{SubmitMode, TaskDefinition, required_date};

pub const DUE_DATE: &str = "dueDate";
pub const ACCESS_CODE: &str = "accessCode";
pub const REMINDER_SENT: &str = "applicant2ReminderSent";
pub const OVERDUE_NOTIFIED: &str = "applicant2OverdueNotificationSent";

/// Nudge applicant 2 a configurable number of days before their response to
/// a joint application is due.
pub fn remind_applicant2() -> TaskDefinition {
    TaskDefinition {
        name: "remind-applicant2",
        description: "Remind applicant 2 to review a joint application before it is due",
        event_id: "system-remind-applicant2",
        query: reminder_query,
        eligibility: reminder_eligibility,
        submit_mode: SubmitMode::CaseId,
        idempotency_flag: Some(REMINDER_SENT),
        target_state: None,
        repair: None,
    }
}

/// Tell applicant 1 their partner did not respond in time.
pub fn applicant2_not_reviewed() -> TaskDefinition {
    TaskDefinition {
        name: "applicant2-not-reviewed",
        description: "Notify applicant 1 when applicant 2 let the review deadline pass",
        event_id: "system-applicant2-not-reviewed",
        query: overdue_query,
        eligibility: overdue_eligibility,
        submit_mode: SubmitMode::CaseId,
        idempotency_flag: Some(OVERDUE_NOTIFIED),
        target_state: None,
        repair: None,
    }
}

fn reminder_query(ctx: &RunContext) -> Query {
    let window_end = ctx.days_ahead(ctx.timing.applicant2_reminder_days_before_due);
    CaseQuery::in_state(State::AwaitingApplicant2Response)
        .must(exists(&data_field(ACCESS_CODE)))
        .not_flagged(REMINDER_SENT)
        .filter(
            range(&data_field(DUE_DATE))
                .gte(ctx.today)
                .through_day(window_end)
                .build(),
        )
        .build()
}

/// Inside `[due - D, due]`. Once the due date passes the overdue path takes over.
fn reminder_eligibility(case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
    if case.text(ACCESS_CODE).is_none() {
        return Ok(false);
    }
    let Some(due) = required_date(case, DUE_DATE, ctx)? else {
        return Ok(false);
    };
    let remind_from = minus_days(due, ctx.timing.applicant2_reminder_days_before_due);
    Ok(remind_from <= ctx.today && ctx.today <= due)
}

fn overdue_query(ctx: &RunContext) -> Query {
    CaseQuery::in_state(State::AwaitingApplicant2Response)
        .not_flagged(OVERDUE_NOTIFIED)
        .filter(range(&data_field(DUE_DATE)).lt(ctx.today).build())
        .build()
}

fn overdue_eligibility(case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
    Ok(required_date(case, DUE_DATE, ctx)?.is_some_and(|due| due < ctx.today))
}
