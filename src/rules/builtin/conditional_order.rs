use crate::engine::context::{RunContext, plus_days};
use crate::engine::error::CaseError;
use crate::engine::types::{CaseDetails, State};
use crate::query::{CaseQuery, Query, data_field, exists};
use crate::rules::{SubmitMode, TaskDefinition, required_date};

pub const DUE_DATE: &str = "dueDate";
pub const APPLICATION_TYPE: &str = "applicationType";
pub const APPLICANT1_SUBMITTED: &str = "coApplicant1SubmittedDate";
pub const APPLICANT2_SUBMITTED: &str = "coApplicant2SubmittedDate";
pub const REMINDED: &str = "applicantsRemindedCanApplyForConditionalOrder";

pub const JOINT_APPLICATION: &str = "jointApplication";

const STATES: [State; 3] = [
    State::AwaitingConditionalOrder,
    State::ConditionalOrderPending,
    State::ConditionalOrderDrafted,
];

pub fn remind_applicants_conditional_order() -> TaskDefinition {
    TaskDefinition {
        name: "remind-applicants-conditional-order",
        description: "Remind applicants who have not yet applied for a conditional order",
        event_id: "system-remind-applicants-conditional-order",
        query,
        eligibility,
        submit_mode: SubmitMode::CaseId,
        idempotency_flag: Some(REMINDED),
        target_state: None,
        repair: None,
    }
}

fn query(ctx: &RunContext) -> Query {
    let not_submitted = |field: &str| CaseQuery::new().must_not(exists(&data_field(field))).build();

    CaseQuery::in_states(&STATES)
        .not_flagged(REMINDED)
        .due_on_or_before(DUE_DATE, ctx.days_ago(ctx.timing.conditional_order_reminder_days))
        .must(
            CaseQuery::new()
                .should(not_submitted(APPLICANT1_SUBMITTED))
                .should(not_submitted(APPLICANT2_SUBMITTED))
                .minimum_should_match(1)
                .build(),
        )
        .build()
}

/// `today >= dueDate + D`, and at least one applicant still has to apply.
/// On a sole application only applicant 1 counts.
fn eligibility(case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
    let Some(due) = required_date(case, DUE_DATE, ctx)? else {
        return Ok(false);
    };
    if plus_days(due, ctx.timing.conditional_order_reminder_days) > ctx.today {
        return Ok(false);
    }

    let joint = case.text(APPLICATION_TYPE) == Some(JOINT_APPLICATION);
    let applicant1_outstanding = case.text(APPLICANT1_SUBMITTED).is_none();
    let applicant2_outstanding = joint && case.text(APPLICANT2_SUBMITTED).is_none();

    Ok(applicant1_outstanding || applicant2_outstanding)
}
