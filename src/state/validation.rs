//! Entry checks a case must pass before it may occupy a state.
//!
//! States are plain data; the checks live in a side table keyed by state.
//! Every check appends to one list so operators see all defects at once.

use crate::engine::types::{CaseDetails, State};

/// Pure check returning human-readable defects.
pub type Validator = fn(&CaseDetails) -> Vec<String>;

/// Look up the entry check for a state, if it declares one.
pub fn validator_for(state: State) -> Option<Validator> {
    match state {
        State::Submitted => Some(validate_submitted),
        State::AwaitingConditionalOrder => Some(validate_awaiting_conditional_order),
        State::ConditionalOrderPronounced => Some(validate_conditional_order_pronounced),
        State::AwaitingFinalOrder => Some(validate_awaiting_final_order),
        State::FinalOrderComplete => Some(validate_final_order_complete),
        _ => None,
    }
}

/// Run the entry check for `state`. States without one accept any case.
pub fn validate(state: State, case: &CaseDetails) -> Vec<String> {
    validator_for(state).map(|v| v(case)).unwrap_or_default()
}

/// Accumulates defects from independent checks.
struct Checks<'a> {
    case: &'a CaseDetails,
    errors: Vec<String>,
}

impl<'a> Checks<'a> {
    fn new(case: &'a CaseDetails) -> Self {
        Self {
            case,
            errors: Vec::new(),
        }
    }

    fn present(mut self, field: &str, label: &str) -> Self {
        if self.case.field(field).is_none_or(is_blank) {
            self.errors.push(format!("{} cannot be empty or null", label));
        }
        self
    }

    fn confirmed(mut self, field: &str, label: &str) -> Self {
        if !self.case.is_yes(field) {
            self.errors.push(format!("{} must be YES", label));
        }
        self
    }

    fn none_outstanding(mut self, field: &str, label: &str) -> Self {
        let outstanding = self
            .case
            .field(field)
            .and_then(|v| v.as_array())
            .map(|items| items.len())
            .unwrap_or(0);
        if outstanding > 0 {
            self.errors
                .push(format!("{} has {} outstanding item(s)", label, outstanding));
        }
        self
    }

    fn done(self) -> Vec<String> {
        self.errors
    }
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn validate_submitted(case: &CaseDetails) -> Vec<String> {
    Checks::new(case)
        .present("applicant1FirstName", "Applicant 1 first name")
        .present("applicant1LastName", "Applicant 1 last name")
        .present("marriageDate", "Marriage date")
        .confirmed("applicant1StatementOfTruth", "Statement of truth")
        .confirmed("applicant1PrayerConfirmed", "Applicant 1 prayer")
        .none_outstanding("documentsOutstanding", "Required documents")
        .done()
}

fn validate_awaiting_conditional_order(case: &CaseDetails) -> Vec<String> {
    Checks::new(case)
        .present("issueDate", "Issue date")
        .present("dueDate", "Due date")
        .done()
}

fn validate_conditional_order_pronounced(case: &CaseDetails) -> Vec<String> {
    Checks::new(case)
        .confirmed("coGranted", "Conditional order granted")
        .present("coGrantedDate", "Conditional order granted date")
        .done()
}

fn validate_awaiting_final_order(case: &CaseDetails) -> Vec<String> {
    Checks::new(case)
        .present("coGrantedDate", "Conditional order granted date")
        .present("dateFinalOrderEligibleFrom", "Date final order eligible from")
        .done()
}

fn validate_final_order_complete(case: &CaseDetails) -> Vec<String> {
    Checks::new(case)
        .present("dateFinalOrderSubmitted", "Date final order submitted")
        .present("finalOrderGrantedDate", "Final order granted date")
        .done()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn case(state: State, data: serde_json::Value) -> CaseDetails {
        CaseDetails {
            id: 1,
            state,
            data: data.as_object().cloned().unwrap_or_default(),
            version: None,
        }
    }

    #[test]
    fn states_without_checks_accept_anything() {
        assert!(validate(State::Draft, &case(State::Draft, json!({}))).is_empty());
        assert!(validator_for(State::Withdrawn).is_none());
    }

    #[test]
    fn submitted_reports_every_defect() {
        let c = case(
            State::AwaitingPayment,
            json!({
                "applicant1FirstName": "Sam",
                "applicant1LastName": " ",
                "applicant1StatementOfTruth": "No",
                "documentsOutstanding": ["marriageCertificate"]
            }),
        );
        let errors = validate(State::Submitted, &c);
        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&"Applicant 1 last name cannot be empty or null".to_string()));
        assert!(errors.contains(&"Marriage date cannot be empty or null".to_string()));
        assert!(errors.contains(&"Statement of truth must be YES".to_string()));
        assert!(errors.contains(&"Applicant 1 prayer must be YES".to_string()));
        assert!(errors.contains(&"Required documents has 1 outstanding item(s)".to_string()));
    }

    #[test]
    fn awaiting_final_order_passes_with_dates() {
        let c = case(
            State::ConditionalOrderPronounced,
            json!({ "coGrantedDate": "2026-01-01", "dateFinalOrderEligibleFrom": "2026-02-13" }),
        );
        assert!(validate(State::AwaitingFinalOrder, &c).is_empty());
    }
}
