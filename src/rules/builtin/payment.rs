use serde_json::Value;

use crate::engine::context::RunContext;
use crate::engine::error::CaseError;
use crate::engine::types::{CaseData, CaseDetails, State};
use crate::query::{CaseQuery, Query, data_field, exists};
use crate::rules::{SubmitMode, TaskDefinition};

pub const PAYMENTS: &str = "applicationPayments";
pub const PAYMENT_TOTAL: &str = "paymentTotal";
pub const PAYMENT_SUCCESS: &str = "success";

/// Cases whose latest payment has gone through move to Submitted. The store
/// rejects the event when the recorded total disagrees with the payments, in
/// which case the total is recomputed and the event resubmitted once.
pub fn progress_paid_cases() -> TaskDefinition {
    TaskDefinition {
        name: "progress-paid-cases",
        description: "Submit applications whose payment has completed",
        event_id: "system-progress-paid-case",
        query,
        eligibility,
        submit_mode: SubmitMode::Snapshot,
        idempotency_flag: None,
        target_state: Some(State::Submitted),
        repair: Some(reconcile_payment_total),
    }
}

fn query(_ctx: &RunContext) -> Query {
    CaseQuery::in_state(State::AwaitingPayment)
        .must(exists(&data_field(PAYMENTS)))
        .build()
}

fn eligibility(case: &CaseDetails, _ctx: &RunContext) -> Result<bool, CaseError> {
    let Some(payments) = case.field(PAYMENTS) else {
        return Ok(false);
    };
    let payments = payments.as_array().ok_or_else(|| {
        CaseError::deserialization(case.id, format!("{} must be a list", PAYMENTS))
    })?;
    Ok(payments
        .last()
        .and_then(payment_status)
        .is_some_and(|status| status == PAYMENT_SUCCESS))
}

/// Payments are stored as `[{ "id": .., "value": { "status", "amount" } }]`.
fn payment_value(item: &Value) -> &Value {
    item.get("value").unwrap_or(item)
}

fn payment_status(item: &Value) -> Option<&str> {
    payment_value(item).get("status").and_then(Value::as_str)
}

/// Sum of successful payment amounts, in pence.
pub fn successful_total(data: &CaseData) -> i64 {
    data.get(PAYMENTS)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|p| payment_status(p) == Some(PAYMENT_SUCCESS))
                .filter_map(|p| payment_value(p).get("amount").and_then(Value::as_i64))
                .sum()
        })
        .unwrap_or(0)
}

/// Set the recorded total to what the successful payments add up to.
pub fn reconcile_payment_total(data: &mut CaseData) {
    let total = successful_total(data);
    data.insert(PAYMENT_TOTAL.to_string(), Value::from(total));
}
