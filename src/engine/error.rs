use thiserror::Error;

/// Failures surfaced by the case store and event submission clients.
///
/// `Credentials`, `Search` and `Conflict` are run-level: they happen before
/// any case is touched and end the run. `Deserialization` and `Submit` are per-case and
/// never escape the case they belong to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaseError {
    #[error("system credentials unavailable: {0}")]
    Credentials(String),

    #[error("case search failed: {0}")]
    Search(String),

    #[error("another run holds the lease: {0}")]
    Conflict(String),

    #[error("case {case_id} could not be deserialized: {reason}")]
    Deserialization { case_id: i64, reason: String },

    #[error("event '{event_id}' rejected for case {case_id}: {reason}")]
    Submit {
        case_id: i64,
        event_id: String,
        reason: String,
    },
}

impl CaseError {
    pub fn deserialization(case_id: i64, reason: impl Into<String>) -> Self {
        CaseError::Deserialization {
            case_id,
            reason: reason.into(),
        }
    }

    pub fn submit(case_id: i64, event_id: &str, reason: impl Into<String>) -> Self {
        CaseError::Submit {
            case_id,
            event_id: event_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this failure ends the whole run rather than a single case.
    pub fn is_run_level(&self) -> bool {
        matches!(
            self,
            CaseError::Credentials(_) | CaseError::Search(_) | CaseError::Conflict(_)
        )
    }

    /// Case id for per-case failures.
    pub fn case_id(&self) -> Option<i64> {
        match self {
            CaseError::Deserialization { case_id, .. } | CaseError::Submit { case_id, .. } => {
                Some(*case_id)
            }
            _ => None,
        }
    }
}
