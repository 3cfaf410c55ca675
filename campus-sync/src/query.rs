//! Query constraints: filters, sort keys, ceilings and cursors.
//!
//! Serialized form:
//! ```text
//! { where:   [{ field, op, value }],
//!   orderBy: [{ field, direction }],
//!   limit?, limitToLast?, startAfter?, endBefore? }
//! ```
//!
//! Constraints compare structurally (`PartialEq`), which is what
//! [`SetMirror`](crate::mirror::SetMirror) uses to decide whether a change
//! needs a new subscription. [`QueryConstraints::execute`] evaluates them over
//! plain records and backs the in-memory transport.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::feed::Record;

/// Upper bound on values in `in`, `not-in` and `array-contains-any`.
pub const MAX_DISJUNCTION_VALUES: usize = 30;

/// Comparison operator of a single filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not-in")]
    NotIn,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "array-contains-any")]
    ArrayContainsAny,
}

impl FilterOp {
    fn takes_array(self) -> bool {
        matches!(self, FilterOp::In | FilterOp::NotIn | FilterOp::ArrayContainsAny)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Ordered, composable description of a collection query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConstraints {
    #[serde(rename = "where", default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_to_last: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_before: Option<Vec<Value>>,
}

impl QueryConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(
        mut self,
        field: impl Into<String>,
        op: FilterOp,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn limit_to_last(mut self, n: usize) -> Self {
        self.limit_to_last = Some(n);
        self
    }

    /// Start strictly after the given sort-key values.
    pub fn start_after(mut self, values: Vec<Value>) -> Self {
        self.start_after = Some(values);
        self
    }

    /// End strictly before the given sort-key values.
    pub fn end_before(mut self, values: Vec<Value>) -> Self {
        self.end_before = Some(values);
        self
    }

    /// Reject constraints no store could execute.
    pub fn validate(&self) -> SyncResult<()> {
        let malformed = |msg: String| Err(SyncError::MalformedConstraints(msg));

        if self.limit.is_some() && self.limit_to_last.is_some() {
            return malformed("limit and limitToLast are mutually exclusive".into());
        }
        if self.limit == Some(0) || self.limit_to_last == Some(0) {
            return malformed("limit must be positive".into());
        }
        if self.limit_to_last.is_some() && self.order_by.is_empty() {
            return malformed("limitToLast requires at least one orderBy".into());
        }
        for (name, cursor) in [("startAfter", &self.start_after), ("endBefore", &self.end_before)] {
            if let Some(values) = cursor {
                if self.order_by.is_empty() {
                    return malformed(format!("{name} requires at least one orderBy"));
                }
                if values.is_empty() || values.len() > self.order_by.len() {
                    return malformed(format!(
                        "{name} has {} values for {} sort keys",
                        values.len(),
                        self.order_by.len()
                    ));
                }
            }
        }
        for f in &self.filters {
            if f.field.is_empty() {
                return malformed("filter on empty field name".into());
            }
            if f.op.takes_array() {
                match &f.value {
                    Value::Array(items)
                        if !items.is_empty() && items.len() <= MAX_DISJUNCTION_VALUES => {}
                    _ => {
                        return malformed(format!(
                            "'{}' {:?} needs a non-empty array of at most \
                             {MAX_DISJUNCTION_VALUES} values",
                            f.field, f.op
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether a record passes every filter.
    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| filter_matches(f, record))
    }

    /// Evaluate the constraints over `(id, record)` pairs.
    ///
    /// Filters, sorts (document id breaks ties), applies cursors, then the
    /// ceiling. Records missing a sort field are excluded.
    pub fn execute<'a, I>(&self, docs: I) -> Vec<(String, Record)>
    where
        I: IntoIterator<Item = (&'a String, &'a Record)>,
    {
        let mut rows: Vec<(String, Record)> = docs
            .into_iter()
            .filter(|(_, r)| self.matches(r))
            .filter(|(_, r)| self.order_by.iter().all(|o| lookup(r, &o.field).is_some()))
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();

        rows.sort_by(|(ia, a), (ib, b)| {
            for key in &self.order_by {
                let ord = directed(key.direction, compare_fields(a, b, &key.field));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            let last = self.order_by.last().map_or(Direction::Asc, |o| o.direction);
            directed(last, ia.cmp(ib))
        });

        if let Some(cursor) = &self.start_after {
            rows.retain(|(_, r)| self.compare_to_cursor(r, cursor) == Ordering::Greater);
        }
        if let Some(cursor) = &self.end_before {
            rows.retain(|(_, r)| self.compare_to_cursor(r, cursor) == Ordering::Less);
        }

        if let Some(n) = self.limit {
            rows.truncate(n);
        } else if let Some(n) = self.limit_to_last {
            let skip = rows.len().saturating_sub(n);
            rows.drain(..skip);
        }
        rows
    }

    fn compare_to_cursor(&self, record: &Record, cursor: &[Value]) -> Ordering {
        for (key, bound) in self.order_by.iter().zip(cursor) {
            let ord = match lookup(record, &key.field) {
                Some(v) => compare_values(v, bound),
                None => Ordering::Less,
            };
            let ord = directed(key.direction, ord);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn directed(direction: Direction, ord: Ordering) -> Ordering {
    match direction {
        Direction::Asc => ord,
        Direction::Desc => ord.reverse(),
    }
}

fn compare_fields(a: &Record, b: &Record, field: &str) -> Ordering {
    match (lookup(a, field), lookup(b, field)) {
        (Some(x), Some(y)) => compare_values(x, y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Resolve a dotted field path (`meta.kind`) inside a record.
pub fn lookup<'a>(record: &'a Record, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Null, Value::Null) | (Value::Object(_), Value::Object(_)) => Ordering::Equal,
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(_), _) | (_, Value::Object(_)) => a == b,
        _ => type_rank(a) == type_rank(b) && compare_values(a, b) == Ordering::Equal,
    }
}

fn filter_matches(filter: &Filter, record: &Record) -> bool {
    let Some(field) = lookup(record, &filter.field) else {
        return false;
    };
    let value = &filter.value;
    let ordered = |accept: fn(Ordering) -> bool| {
        type_rank(field) == type_rank(value) && accept(compare_values(field, value))
    };
    match filter.op {
        FilterOp::Eq => same_value(field, value),
        FilterOp::NotEq => !same_value(field, value),
        FilterOp::Lt => ordered(|o| o == Ordering::Less),
        FilterOp::Lte => ordered(|o| o != Ordering::Greater),
        FilterOp::Gt => ordered(|o| o == Ordering::Greater),
        FilterOp::Gte => ordered(|o| o != Ordering::Less),
        FilterOp::In => value
            .as_array()
            .is_some_and(|items| items.iter().any(|i| same_value(field, i))),
        FilterOp::NotIn => value
            .as_array()
            .is_some_and(|items| !items.iter().any(|i| same_value(field, i))),
        FilterOp::ArrayContains => field
            .as_array()
            .is_some_and(|items| items.iter().any(|i| same_value(i, value))),
        FilterOp::ArrayContainsAny => match (field.as_array(), value.as_array()) {
            (Some(have), Some(want)) => have.iter().any(|h| want.iter().any(|w| same_value(h, w))),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn rows(items: &[(&str, Value)]) -> Vec<(String, Record)> {
        items.iter().map(|(id, v)| (id.to_string(), rec(v.clone()))).collect()
    }

    fn run(q: &QueryConstraints, data: &[(String, Record)]) -> Vec<String> {
        q.execute(data.iter().map(|(id, r)| (id, r)))
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    #[test]
    fn test_serialized_shape() {
        let q = QueryConstraints::new()
            .filter("recipient", FilterOp::Eq, "u1")
            .order_by("createdAt", Direction::Desc)
            .limit(50);
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(
            v,
            json!({
                "where": [{"field": "recipient", "op": "==", "value": "u1"}],
                "orderBy": [{"field": "createdAt", "direction": "desc"}],
                "limit": 50
            })
        );
    }

    #[test]
    fn test_structural_equality() {
        let a = QueryConstraints::new().filter("kind", FilterOp::Eq, "course");
        let b = QueryConstraints::new().filter("kind", FilterOp::Eq, "course");
        let c = QueryConstraints::new().filter("kind", FilterOp::Eq, "system");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_validate_rejects_bad_ceilings() {
        assert!(QueryConstraints::new().limit(0).validate().is_err());
        let both = QueryConstraints::new()
            .order_by("a", Direction::Asc)
            .limit(1)
            .limit_to_last(1);
        assert!(both.validate().is_err());
        assert!(QueryConstraints::new().limit_to_last(3).validate().is_err());
    }

    #[test]
    fn test_validate_cursor_needs_order() {
        let q = QueryConstraints::new().start_after(vec![json!(1)]);
        assert!(matches!(q.validate(), Err(SyncError::MalformedConstraints(_))));

        let q = QueryConstraints::new()
            .order_by("a", Direction::Asc)
            .start_after(vec![json!(1), json!(2)]);
        assert!(q.validate().is_err());
    }

    #[test]
    fn test_validate_disjunction_values() {
        let q = QueryConstraints::new().filter("kind", FilterOp::In, "course");
        assert!(q.validate().is_err());
        let q = QueryConstraints::new().filter("kind", FilterOp::In, json!([]));
        assert!(q.validate().is_err());
        let q = QueryConstraints::new().filter("kind", FilterOp::In, json!(["a", "b"]));
        assert!(q.validate().is_ok());
    }

    #[test]
    fn test_filter_operators() {
        let data = rows(&[
            ("a", json!({"n": 1, "tags": ["x"], "kind": "course"})),
            ("b", json!({"n": 2, "tags": ["y", "z"], "kind": "system"})),
            ("c", json!({"n": "3", "kind": "course"})),
        ]);

        let q = QueryConstraints::new().filter("n", FilterOp::Gte, 2);
        assert_eq!(run(&q, &data), vec!["b"]);

        let q = QueryConstraints::new().filter("kind", FilterOp::NotEq, "course");
        assert_eq!(run(&q, &data), vec!["b"]);

        let q = QueryConstraints::new().filter("tags", FilterOp::ArrayContains, "x");
        assert_eq!(run(&q, &data), vec!["a"]);

        let q =
            QueryConstraints::new().filter("tags", FilterOp::ArrayContainsAny, json!(["z", "x"]));
        assert_eq!(run(&q, &data), vec!["a", "b"]);

        let q = QueryConstraints::new().filter("kind", FilterOp::NotIn, json!(["system"]));
        assert_eq!(run(&q, &data), vec!["a", "c"]);
    }

    #[test]
    fn test_number_equality_ignores_representation() {
        let data = rows(&[("a", json!({"n": 1.0}))]);
        let q = QueryConstraints::new().filter("n", FilterOp::Eq, 1);
        assert_eq!(run(&q, &data), vec!["a"]);
    }

    #[test]
    fn test_order_limit_and_cursors() {
        let data = rows(&[
            ("a", json!({"t": 10})),
            ("b", json!({"t": 30})),
            ("c", json!({"t": 20})),
            ("d", json!({"t": 40})),
            ("e", json!({})),
        ]);

        let desc = QueryConstraints::new().order_by("t", Direction::Desc);
        assert_eq!(run(&desc, &data), vec!["d", "b", "c", "a"]);
        assert_eq!(run(&desc.clone().limit(2), &data), vec!["d", "b"]);
        assert_eq!(run(&desc.clone().limit_to_last(2), &data), vec!["c", "a"]);
        assert_eq!(run(&desc.clone().start_after(vec![json!(30)]), &data), vec!["c", "a"]);
        assert_eq!(run(&desc.clone().end_before(vec![json!(20)]), &data), vec!["d", "b"]);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let data = rows(&[("b", json!({"t": 1})), ("a", json!({"t": 1}))]);
        let q = QueryConstraints::new().order_by("t", Direction::Asc);
        assert_eq!(run(&q, &data), vec!["a", "b"]);
    }

    #[test]
    fn test_dotted_lookup() {
        let r = rec(json!({"meta": {"kind": "quiz"}}));
        assert_eq!(lookup(&r, "meta.kind"), Some(&json!("quiz")));
        assert_eq!(lookup(&r, "meta.missing"), None);
    }
}
