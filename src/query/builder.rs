use chrono::NaiveDate;
use serde_json::Value;

use crate::engine::context::plus_days;
use crate::engine::types::{State, YES};
use crate::query::{BoolQuery, Query, RangeQuery, STATE_FIELD};

/// Fluent builder for "cases in state S that are due for advancement".
///
/// Each builder owns its own clause lists, so every `build()` yields an
/// independent tree and the builder can be used from any number of tasks.
#[derive(Debug, Clone, Default)]
pub struct CaseQuery {
    inner: BoolQuery,
}

impl CaseQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cases in exactly one state.
    pub fn in_state(state: State) -> Self {
        Self::new().must(term(STATE_FIELD, state.as_str()))
    }

    /// Cases in any of the given states. A single state collapses to a
    /// plain term clause; several become a nested OR-group.
    pub fn in_states(states: &[State]) -> Self {
        match states {
            [single] => Self::in_state(*single),
            _ => {
                let group = states
                    .iter()
                    .fold(CaseQuery::new(), |q, s| q.should(term(STATE_FIELD, s.as_str())))
                    .minimum_should_match(1)
                    .build();
                Self::new().must(group)
            }
        }
    }

    pub fn must(mut self, query: Query) -> Self {
        self.inner.must.push(query);
        self
    }

    pub fn must_not(mut self, query: Query) -> Self {
        self.inner.must_not.push(query);
        self
    }

    pub fn filter(mut self, query: Query) -> Self {
        self.inner.filter.push(query);
        self
    }

    pub fn should(mut self, query: Query) -> Self {
        self.inner.should.push(query);
        self
    }

    pub fn minimum_should_match(mut self, n: u32) -> Self {
        self.inner.minimum_should_match = Some(n);
        self
    }

    /// Exclude cases where a flag in the case data is already set.
    /// Cases that never had the field stay in the result.
    pub fn not_flagged(self, field: &str) -> Self {
        self.must_not(flag_set(field))
    }

    /// Restrict a case-data date to on or before the calendar day `date`.
    pub fn due_on_or_before(self, field: &str, date: NaiveDate) -> Self {
        self.filter(range(&data_field(field)).through_day(date).build())
    }

    pub fn build(self) -> Query {
        Query::Bool(self.inner)
    }
}

/// Path of a business field inside the case data.
pub fn data_field(name: &str) -> String {
    format!("data.{}", name)
}

pub fn term(field: &str, value: impl Into<Value>) -> Query {
    Query::Term {
        field: field.to_string(),
        value: value.into(),
    }
}

pub fn match_value(field: &str, value: impl Into<Value>) -> Query {
    Query::Match {
        field: field.to_string(),
        value: value.into(),
    }
}

pub fn exists(field: &str) -> Query {
    Query::Exists {
        field: field.to_string(),
    }
}

/// `match(data.<field>, Yes)`.
pub fn flag_set(field: &str) -> Query {
    match_value(&data_field(field), YES)
}

pub fn range(field: &str) -> RangeBuilder {
    RangeBuilder {
        inner: RangeQuery {
            field: field.to_string(),
            ..Default::default()
        },
    }
}

/// Bounds for a range clause. Dates serialise as `YYYY-MM-DD`.
#[derive(Debug, Clone)]
pub struct RangeBuilder {
    inner: RangeQuery,
}

impl RangeBuilder {
    pub fn gt(mut self, bound: impl RangeBound) -> Self {
        self.inner.gt = Some(bound.into_bound());
        self
    }

    pub fn gte(mut self, bound: impl RangeBound) -> Self {
        self.inner.gte = Some(bound.into_bound());
        self
    }

    pub fn lt(mut self, bound: impl RangeBound) -> Self {
        self.inner.lt = Some(bound.into_bound());
        self
    }

    pub fn lte(mut self, bound: impl RangeBound) -> Self {
        self.inner.lte = Some(bound.into_bound());
        self
    }

    /// Upper bound covering the whole of `day`. Sent as `lt` the next day so
    /// date-times stored on `day` (`2026-10-03T10:30:00`) still fall inside.
    pub fn through_day(self, day: NaiveDate) -> Self {
        self.lt(plus_days(day, 1))
    }

    pub fn build(self) -> Query {
        Query::Range(self.inner)
    }
}

/// Values usable as a range bound.
pub trait RangeBound {
    fn into_bound(self) -> Value;
}

impl RangeBound for NaiveDate {
    fn into_bound(self) -> Value {
        Value::String(self.format("%Y-%m-%d").to_string())
    }
}

impl RangeBound for i64 {
    fn into_bound(self) -> Value {
        Value::from(self)
    }
}

impl RangeBound for f64 {
    fn into_bound(self) -> Value {
        Value::from(self)
    }
}

impl RangeBound for &str {
    fn into_bound(self) -> Value {
        Value::String(self.to_string())
    }
}
