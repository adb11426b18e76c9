use crate::engine::context::{RunContext, plus_days};
use crate::engine::error::CaseError;
use crate::engine::types::{CaseDetails, State};
use crate::query::{CaseQuery, Query, data_field, match_value};
use crate::rules::{SubmitMode, TaskDefinition, required_date};

pub const ELIGIBLE_FROM: &str = "dateFinalOrderEligibleFrom";
pub const ELIGIBLE_TO_RESPONDENT: &str = "dateFinalOrderEligibleToRespondent";
pub const DATE_SUBMITTED: &str = "dateFinalOrderSubmitted";
pub const APPLICATION_TYPE: &str = "applicationType";
pub const SOLE_APPLICATION: &str = "soleApplication";

pub const APPLICANT1_REMINDED: &str = "finalOrderReminderSentApplicant1";
pub const JOINT_REMINDED: &str = "applicantsRemindedAwaitingJointFinalOrder";
pub const RESPONDENT_NOTIFIED: &str = "finalOrderRespondentNotifiedCanApply";

/// Pronounced cases become AwaitingFinalOrder on the day they are eligible.
/// The date is fixed at pronouncement, so the snapshot is submitted as read.
pub fn progress_to_awaiting_final_order() -> TaskDefinition {
    TaskDefinition {
        name: "progress-to-awaiting-final-order",
        description: "Move pronounced cases to AwaitingFinalOrder once final order is available",
        event_id: "system-progress-case-awaiting-final-order",
        query: progress_query,
        eligibility: progress_eligibility,
        submit_mode: SubmitMode::Snapshot,
        idempotency_flag: None,
        target_state: Some(State::AwaitingFinalOrder),
        repair: None,
    }
}

pub fn remind_applicants_final_order() -> TaskDefinition {
    TaskDefinition {
        name: "remind-applicants-final-order",
        description: "Remind applicants they can apply for a final order",
        event_id: "system-remind-applicants-final-order",
        query: reminder_query,
        eligibility: reminder_eligibility,
        submit_mode: SubmitMode::CaseId,
        idempotency_flag: Some(APPLICANT1_REMINDED),
        target_state: None,
        repair: None,
    }
}

/// One applicant applied for a joint final order; chase the other after D days.
pub fn remind_awaiting_joint_final_order() -> TaskDefinition {
    TaskDefinition {
        name: "remind-awaiting-joint-final-order",
        description: "Remind the other applicant to confirm a joint final order application",
        event_id: "system-remind-applicants-awaiting-joint-final-order",
        query: joint_query,
        eligibility: joint_eligibility,
        submit_mode: SubmitMode::CaseId,
        idempotency_flag: Some(JOINT_REMINDED),
        target_state: None,
        repair: None,
    }
}

/// On sole applications the respondent may apply once their own date arrives
/// and the applicant still has not.
pub fn notify_respondent_apply_final_order() -> TaskDefinition {
    TaskDefinition {
        name: "notify-respondent-apply-final-order",
        description: "Tell the respondent they can now apply for a final order",
        event_id: "system-notify-respondent-apply-final-order",
        query: respondent_query,
        eligibility: respondent_eligibility,
        submit_mode: SubmitMode::CaseId,
        idempotency_flag: Some(RESPONDENT_NOTIFIED),
        target_state: None,
        repair: None,
    }
}

fn progress_query(ctx: &RunContext) -> Query {
    CaseQuery::in_state(State::ConditionalOrderPronounced)
        .due_on_or_before(ELIGIBLE_FROM, ctx.today)
        .build()
}

fn progress_eligibility(case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
    Ok(required_date(case, ELIGIBLE_FROM, ctx)?.is_some_and(|from| from <= ctx.today))
}

// Date offset is checked client-side: the query only narrows by state and flag.
fn reminder_query(_ctx: &RunContext) -> Query {
    CaseQuery::in_state(State::AwaitingFinalOrder)
        .not_flagged(APPLICANT1_REMINDED)
        .build()
}

fn reminder_eligibility(case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
    if case.text(DATE_SUBMITTED).is_some() {
        return Ok(false);
    }
    Ok(required_date(case, ELIGIBLE_FROM, ctx)?
        .is_some_and(|from| plus_days(from, ctx.timing.final_order_reminder_days) <= ctx.today))
}

fn joint_query(ctx: &RunContext) -> Query {
    CaseQuery::in_state(State::AwaitingJointFinalOrder)
        .not_flagged(JOINT_REMINDED)
        .due_on_or_before(DATE_SUBMITTED, ctx.days_ago(ctx.timing.joint_final_order_reminder_days))
        .build()
}

/// `today >= dateFinalOrderSubmitted + D`, inclusive.
fn joint_eligibility(case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
    Ok(required_date(case, DATE_SUBMITTED, ctx)?.is_some_and(|submitted| {
        plus_days(submitted, ctx.timing.joint_final_order_reminder_days) <= ctx.today
    }))
}

fn respondent_query(ctx: &RunContext) -> Query {
    CaseQuery::in_state(State::AwaitingFinalOrder)
        .must(match_value(&data_field(APPLICATION_TYPE), SOLE_APPLICATION))
        .not_flagged(RESPONDENT_NOTIFIED)
        .due_on_or_before(ELIGIBLE_TO_RESPONDENT, ctx.today)
        .build()
}

fn respondent_eligibility(case: &CaseDetails, ctx: &RunContext) -> Result<bool, CaseError> {
    if case.text(APPLICATION_TYPE) != Some(SOLE_APPLICATION) || case.text(DATE_SUBMITTED).is_some() {
        return Ok(false);
    }
    Ok(required_date(case, ELIGIBLE_TO_RESPONDENT, ctx)?.is_some_and(|from| from <= ctx.today))
}
