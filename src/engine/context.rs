use chrono::{DateTime, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Day offsets used by the built-in rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingPolicy {
    /// Remind applicant 2 this many days before their response is due.
    pub applicant2_reminder_days_before_due: u64,
    /// Remind applicants this many days after the conditional order due date.
    pub conditional_order_reminder_days: u64,
    /// Remind applicants this many days after they became eligible for a final order.
    pub final_order_reminder_days: u64,
    /// Remind the other applicant this many days after a joint final order was submitted.
    pub joint_final_order_reminder_days: u64,
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self {
            applicant2_reminder_days_before_due: 10,
            conditional_order_reminder_days: 14,
            final_order_reminder_days: 14,
            joint_final_order_reminder_days: 14,
        }
    }
}

/// Everything a rule may look at besides the case itself.
///
/// Built once per run: `today` is frozen at the start so every date window
/// stays the same for the whole run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub task: String,
    pub now: DateTime<Utc>,
    pub today: NaiveDate,
    pub tz: Tz,
    pub timing: TimingPolicy,
}

impl RunContext {
    pub fn new(run_id: &str, task: &str, now: DateTime<Utc>, tz: Tz, timing: TimingPolicy) -> Self {
        Self {
            run_id: run_id.to_string(),
            task: task.to_string(),
            now,
            today: now.with_timezone(&tz).date_naive(),
            tz,
            timing,
        }
    }

    /// Today shifted back by `days`, saturating at the earliest date.
    pub fn days_ago(&self, days: u64) -> NaiveDate {
        self.today
            .checked_sub_days(Days::new(days))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Today shifted forward by `days`, saturating at the latest date.
    pub fn days_ahead(&self, days: u64) -> NaiveDate {
        self.today
            .checked_add_days(Days::new(days))
            .unwrap_or(NaiveDate::MAX)
    }
}

/// `date + days`, saturating.
pub fn plus_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap_or(NaiveDate::MAX)
}

/// `date - days`, saturating.
pub fn minus_days(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN)
}
