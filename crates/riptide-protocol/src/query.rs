//! Query model: filter/order/limit triples plus the local matcher that
//! mirrors the server's SQL evaluation.
//!
//! Field names are whitelisted to `[A-Za-z0-9.]+`; anything else is silently
//! dropped rather than rejected, so a hostile field name can never reach the
//! storage layer as text. Values always travel as bound parameters.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::{compare_values, extract_field};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "like", alias = "LIKE")]
    Like,
}

/// One `(field, op, value)` triple. Filters in a query are ANDed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    /// Evaluate this filter against a document payload, mirroring the SQL
    /// semantics: a missing or JSON-null field matches nothing, comparisons
    /// follow [`compare_values`].
    pub fn matches(&self, data: &Value) -> bool {
        let Some(field) = extract_field(data, &self.field) else {
            return false;
        };
        if field.is_null() {
            return false;
        }
        match self.op {
            FilterOp::Eq => field == &self.value,
            FilterOp::Ne => field != &self.value,
            FilterOp::Lt => compare_values(field, &self.value) == Ordering::Less,
            FilterOp::Le => compare_values(field, &self.value) != Ordering::Greater,
            FilterOp::Gt => compare_values(field, &self.value) == Ordering::Greater,
            FilterOp::Ge => compare_values(field, &self.value) != Ordering::Less,
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.contains(field)),
            FilterOp::ArrayContains => field
                .as_array()
                .is_some_and(|entries| entries.contains(&self.value)),
            FilterOp::Like => match (field.as_str(), self.value.as_str()) {
                (Some(text), Some(pattern)) => like_match(pattern, text),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "ASC")]
    Asc,
    #[serde(alias = "DESC")]
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A compiled query: ANDed filters, optional order, optional limit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl QuerySpec {
    /// Drop every filter (and any order) whose field falls outside the
    /// whitelist. Dropping rather than erroring is the contract.
    pub fn sanitized(&self) -> Self {
        Self {
            filters: self
                .filters
                .iter()
                .filter(|filter| is_safe_field(&filter.field))
                .cloned()
                .collect(),
            order_by: self
                .order_by
                .as_ref()
                .filter(|order| is_safe_field(&order.field))
                .cloned(),
            limit: self.limit.filter(|limit| *limit > 0),
        }
    }

    /// True iff every (sanitized) filter matches the payload. Used by the
    /// client's offline query path and live result-set maintenance; parity
    /// with the server's SQL evaluation is covered by tests.
    pub fn matches(&self, data: &Value) -> bool {
        self.filters
            .iter()
            .filter(|filter| is_safe_field(&filter.field))
            .all(|filter| filter.matches(data))
    }

    /// Whether delta maintenance is insufficient and changes require an
    /// authoritative re-fetch (order and limit boundaries cannot be
    /// maintained from deltas alone).
    pub fn needs_refetch_on_change(&self) -> bool {
        self.order_by.is_some() || self.limit.is_some()
    }
}

/// Whitelist check for field names interpolated into JSON paths.
pub fn is_safe_field(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.')
}

/// SQL LIKE over the two wildcards `%` (any run) and `_` (one char),
/// ASCII-case-insensitive like SQLite's default collation.
pub fn like_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.split_first() {
            None => text.is_empty(),
            Some((b'%', rest)) => (0..=text.len()).any(|skip| inner(rest, &text[skip..])),
            Some((b'_', rest)) => !text.is_empty() && inner(rest, &text[1..]),
            Some((ch, rest)) => text
                .split_first()
                .is_some_and(|(first, tail)| first.eq_ignore_ascii_case(ch) && inner(rest, tail)),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}
