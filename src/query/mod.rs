pub mod builder;

pub use builder::{CaseQuery, RangeBuilder, data_field, exists, flag_set, match_value, range, term};

use std::cmp::Ordering;

use serde::{Serialize, Serializer};
use serde_json::{Value, json};

use crate::engine::types::RawCase;

/// Field holding the case state in store metadata.
pub const STATE_FIELD: &str = "state";
/// Field holding the case reference in store metadata.
pub const REFERENCE_FIELD: &str = "reference";

/// A boolean predicate tree over case metadata and case data.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Exact value match.
    Term { field: String, value: Value },
    /// Analysed match; strings compare case-insensitively.
    Match { field: String, value: Value },
    Range(RangeQuery),
    Exists { field: String },
    Bool(BoolQuery),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeQuery {
    pub field: String,
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoolQuery {
    pub must: Vec<Query>,
    pub should: Vec<Query>,
    pub must_not: Vec<Query>,
    pub filter: Vec<Query>,
    pub minimum_should_match: Option<u32>,
}

impl Query {
    /// Wire representation sent to the case store.
    pub fn to_json(&self) -> Value {
        match self {
            Query::Term { field, value } => json!({ "term": { field: value } }),
            Query::Match { field, value } => json!({ "match": { field: value } }),
            Query::Exists { field } => json!({ "exists": { "field": field } }),
            Query::Range(r) => {
                let mut bounds = serde_json::Map::new();
                for (key, bound) in [("gt", &r.gt), ("gte", &r.gte), ("lt", &r.lt), ("lte", &r.lte)] {
                    if let Some(v) = bound {
                        bounds.insert(key.to_string(), v.clone());
                    }
                }
                json!({ "range": { r.field.clone(): bounds } })
            }
            Query::Bool(b) => {
                let mut clauses = serde_json::Map::new();
                for (key, list) in [
                    ("must", &b.must),
                    ("should", &b.should),
                    ("must_not", &b.must_not),
                    ("filter", &b.filter),
                ] {
                    if !list.is_empty() {
                        clauses.insert(
                            key.to_string(),
                            Value::Array(list.iter().map(Query::to_json).collect()),
                        );
                    }
                }
                if let Some(n) = b.minimum_should_match {
                    clauses.insert("minimum_should_match".to_string(), json!(n));
                }
                json!({ "bool": clauses })
            }
        }
    }

    /// Evaluate the predicate against a case, with the same semantics the
    /// store applies. An absent field never matches a positive clause, so
    /// `must_not` over an absent field lets the case through.
    pub fn matches(&self, case: &RawCase) -> bool {
        match self {
            Query::Term { field, value } => {
                resolve(case, field).is_some_and(|found| any_element(&found, |v| v == value))
            }
            Query::Match { field, value } => resolve(case, field)
                .is_some_and(|found| any_element(&found, |v| loosely_equal(v, value))),
            Query::Exists { field } => resolve(case, field).is_some_and(|v| match v {
                Value::Null => false,
                Value::Array(items) => !items.is_empty(),
                _ => true,
            }),
            Query::Range(r) => resolve(case, &r.field).is_some_and(|found| r.contains(&found)),
            Query::Bool(b) => b.matches(case),
        }
    }
}

impl Serialize for Query {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl RangeQuery {
    fn contains(&self, value: &Value) -> bool {
        let check = |bound: &Option<Value>, ok: &dyn Fn(Ordering) -> bool| match bound {
            Some(b) => compare(value, b).is_some_and(ok),
            None => true,
        };
        check(&self.gt, &|o| o == Ordering::Greater)
            && check(&self.gte, &|o| o != Ordering::Less)
            && check(&self.lt, &|o| o == Ordering::Less)
            && check(&self.lte, &|o| o != Ordering::Greater)
    }
}

impl BoolQuery {
    fn matches(&self, case: &RawCase) -> bool {
        if !self.must.iter().all(|q| q.matches(case)) {
            return false;
        }
        if !self.filter.iter().all(|q| q.matches(case)) {
            return false;
        }
        if self.must_not.iter().any(|q| q.matches(case)) {
            return false;
        }

        let should_hits = self.should.iter().filter(|q| q.matches(case)).count() as u32;
        let required = match self.minimum_should_match {
            Some(n) => n,
            // With no positive clauses the should group is what selects
            None if self.must.is_empty() && self.filter.is_empty() && !self.should.is_empty() => 1,
            None => 0,
        };
        should_hits >= required
    }
}

/// Resolve a field path against a stored case.
fn resolve(case: &RawCase, field: &str) -> Option<Value> {
    match field {
        STATE_FIELD => Some(Value::String(case.state.clone())),
        REFERENCE_FIELD | "id" => Some(Value::from(case.id)),
        _ => {
            let path = field.strip_prefix("data.")?;
            let mut current = &case.data;
            for part in path.split('.') {
                current = current.get(part)?;
            }
            Some(current.clone())
        }
    }
}

fn any_element(found: &Value, pred: impl Fn(&Value) -> bool) -> bool {
    match found {
        Value::Array(items) => items.iter().any(&pred),
        other => pred(other),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        _ => a == b,
    }
}

/// Order two scalar values. ISO dates order correctly as strings.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

/// One page request against the case store. Paging is cursor based: the
/// cursor is the last case reference of the previous page.
#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
    pub query: Query,
    pub size: usize,
    pub sort: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_after: Option<Vec<i64>>,
}

impl SearchRequest {
    pub fn new(query: Query, size: usize) -> Self {
        Self {
            query,
            size,
            sort: vec![json!({ REFERENCE_FIELD: "asc" })],
            search_after: None,
        }
    }

    /// The same request, starting after the given case reference.
    pub fn after(&self, cursor: i64) -> Self {
        Self {
            search_after: Some(vec![cursor]),
            ..self.clone()
        }
    }

    pub fn cursor(&self) -> Option<i64> {
        self.search_after.as_ref().and_then(|c| c.first().copied())
    }
}
