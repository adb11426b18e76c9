use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::engine::error::CaseError;

/// Business payload of a case, a semi-structured JSON object.
pub type CaseData = serde_json::Map<String, serde_json::Value>;

/// Stored value for an affirmative flag.
pub const YES: &str = "Yes";
/// Stored value for a negative flag.
pub const NO: &str = "No";

/// Lifecycle stage of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Draft,
    AwaitingPayment,
    Submitted,
    AwaitingDocuments,
    AwaitingService,
    AwaitingAos,
    AosDrafted,
    AosOverdue,
    AwaitingApplicant2Response,
    Applicant2Approved,
    Holding,
    AwaitingConditionalOrder,
    ConditionalOrderDrafted,
    ConditionalOrderPending,
    AwaitingLegalAdvisorReferral,
    AwaitingPronouncement,
    ConditionalOrderPronounced,
    AwaitingFinalOrder,
    AwaitingJointFinalOrder,
    FinalOrderRequested,
    FinalOrderOverdue,
    FinalOrderComplete,
    Withdrawn,
    Rejected,
}

impl State {
    pub const ALL: [State; 24] = [
        State::Draft,
        State::AwaitingPayment,
        State::Submitted,
        State::AwaitingDocuments,
        State::AwaitingService,
        State::AwaitingAos,
        State::AosDrafted,
        State::AosOverdue,
        State::AwaitingApplicant2Response,
        State::Applicant2Approved,
        State::Holding,
        State::AwaitingConditionalOrder,
        State::ConditionalOrderDrafted,
        State::ConditionalOrderPending,
        State::AwaitingLegalAdvisorReferral,
        State::AwaitingPronouncement,
        State::ConditionalOrderPronounced,
        State::AwaitingFinalOrder,
        State::AwaitingJointFinalOrder,
        State::FinalOrderRequested,
        State::FinalOrderOverdue,
        State::FinalOrderComplete,
        State::Withdrawn,
        State::Rejected,
    ];

    /// Identifier used by the case store.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Draft => "Draft",
            State::AwaitingPayment => "AwaitingPayment",
            State::Submitted => "Submitted",
            State::AwaitingDocuments => "AwaitingDocuments",
            State::AwaitingService => "AwaitingService",
            State::AwaitingAos => "AwaitingAos",
            State::AosDrafted => "AosDrafted",
            State::AosOverdue => "AosOverdue",
            State::AwaitingApplicant2Response => "AwaitingApplicant2Response",
            State::Applicant2Approved => "Applicant2Approved",
            State::Holding => "Holding",
            State::AwaitingConditionalOrder => "AwaitingConditionalOrder",
            State::ConditionalOrderDrafted => "ConditionalOrderDrafted",
            State::ConditionalOrderPending => "ConditionalOrderPending",
            State::AwaitingLegalAdvisorReferral => "AwaitingLegalAdvisorReferral",
            State::AwaitingPronouncement => "AwaitingPronouncement",
            State::ConditionalOrderPronounced => "ConditionalOrderPronounced",
            State::AwaitingFinalOrder => "AwaitingFinalOrder",
            State::AwaitingJointFinalOrder => "AwaitingJointFinalOrder",
            State::FinalOrderRequested => "FinalOrderRequested",
            State::FinalOrderOverdue => "FinalOrderOverdue",
            State::FinalOrderComplete => "FinalOrderComplete",
            State::Withdrawn => "Withdrawn",
            State::Rejected => "Rejected",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown state '{}'", s))
    }
}

/// A case record exactly as the store returns it, before any typing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCase {
    pub id: i64,
    pub state: String,
    #[serde(default, rename = "case_data", alias = "data")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

impl RawCase {
    pub fn new(id: i64, state: State, data: serde_json::Value) -> Self {
        Self {
            id,
            state: state.to_string(),
            data,
            version: Some(1),
        }
    }
}

/// A typed case, ready for eligibility evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseDetails {
    pub id: i64,
    pub state: State,
    pub data: CaseData,
    pub version: Option<i64>,
}

impl TryFrom<RawCase> for CaseDetails {
    type Error = CaseError;

    fn try_from(raw: RawCase) -> Result<Self, Self::Error> {
        let state = raw
            .state
            .parse::<State>()
            .map_err(|e| CaseError::deserialization(raw.id, e))?;

        let data = match raw.data {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => CaseData::new(),
            other => {
                return Err(CaseError::deserialization(
                    raw.id,
                    format!("case data must be an object, got {}", json_kind(&other)),
                ));
            }
        };

        Ok(Self {
            id: raw.id,
            state,
            data,
            version: raw.version,
        })
    }
}

impl From<CaseDetails> for RawCase {
    fn from(case: CaseDetails) -> Self {
        Self {
            id: case.id,
            state: case.state.to_string(),
            data: serde_json::Value::Object(case.data),
            version: case.version,
        }
    }
}

impl CaseDetails {
    /// Look up a field by dotted path inside the case data.
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.data.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }

    /// A non-empty string field.
    pub fn text(&self, path: &str) -> Option<&str> {
        self.field(path)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// Whether a flag field is set. Absent, null and "No" all read as unset.
    pub fn is_yes(&self, path: &str) -> bool {
        match self.field(path) {
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case(YES),
            Some(serde_json::Value::Bool(b)) => *b,
            _ => false,
        }
    }

    /// Read a date field as a calendar date in the case's time zone.
    ///
    /// A missing, null or empty field is `Ok(None)` ("not yet eligible").
    /// Anything unparseable is a deserialization failure for this case.
    pub fn date(&self, path: &str, tz: Tz) -> Result<Option<NaiveDate>, CaseError> {
        match self.field(path) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => parse_case_date(value, tz)
                .map_err(|reason| CaseError::deserialization(self.id, format!("{}: {}", path, reason))),
        }
    }
}

/// Parse a stored date or date-time into a local calendar date.
///
/// Plain dates are already local. Date-times without an offset are local
/// wall-clock values; date-times with an offset are converted into `tz`.
pub fn parse_case_date(value: &serde_json::Value, tz: Tz) -> Result<Option<NaiveDate>, String> {
    let s = match value {
        serde_json::Value::String(s) => s.trim(),
        serde_json::Value::Null => return Ok(None),
        other => return Err(format!("expected a date string, got {}", json_kind(other))),
    };

    if s.is_empty() {
        return Ok(None);
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Some(date));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(Some(dt.with_timezone(&tz).date_naive()));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Some(dt.date()));
    }

    Err(format!("unrecognised date '{}'", s))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Lifecycle of a single task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    AbortedOnSearchError,
    AbortedOnConflict,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "idle"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::AbortedOnSearchError => write!(f, "aborted_on_search_error"),
            RunStatus::AbortedOnConflict => write!(f, "aborted_on_conflict"),
        }
    }
}

/// A case that failed during a run, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseFailure {
    pub case_id: i64,
    pub error: String,
}

/// Ephemeral record of one task run, kept only for logging and reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub run_id: String,
    pub task: String,
    pub status: RunStatus,
    pub started: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    pub matched: Vec<i64>,
    pub eligible: Vec<i64>,
    pub succeeded: Vec<i64>,
    pub skipped: Vec<i64>,
    pub failed: Vec<CaseFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl TaskRun {
    pub fn new(run_id: &str, task: &str, started: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            task: task.to_string(),
            status: RunStatus::Idle,
            started,
            finished: None,
            matched: Vec::new(),
            eligible: Vec::new(),
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            abort_reason: None,
        }
    }

    pub fn failed_ids(&self) -> Vec<i64> {
        self.failed.iter().map(|f| f.case_id).collect()
    }
}
