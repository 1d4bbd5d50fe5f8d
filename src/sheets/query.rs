//! In-memory filtering, sorting and pagination over decoded records.
//!
//! The backing store has no server-side filtering, so every query runs over
//! the full table. Stages always run in the same order: filters (implicit
//! AND), then a stable single-column sort, then offset/limit. A malformed
//! field value never fails a query; the filter just does not match it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::codec::{coerce_bool, coerce_date, coerce_number};
use super::types::{FieldValue, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Ne => "ne",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
            FilterOperator::Contains => "contains",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "eq" => Some(FilterOperator::Eq),
            "ne" => Some(FilterOperator::Ne),
            "gt" => Some(FilterOperator::Gt),
            "gte" => Some(FilterOperator::Gte),
            "lt" => Some(FilterOperator::Lt),
            "lte" => Some(FilterOperator::Lte),
            "in" => Some(FilterOperator::In),
            "contains" => Some(FilterOperator::Contains),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: FieldValue,
}

impl Filter {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: impl Into<FieldValue>) -> Self {
        Filter {
            column: column.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(column, FilterOperator::Eq, value)
    }

    /// Membership filter over a list of candidate values
    pub fn one_of<V: Into<FieldValue>>(column: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        let items = values
            .into_iter()
            .map(|v| field_to_json(&v.into()))
            .collect();
        Self::new(column, FilterOperator::In, FieldValue::Json(serde_json::Value::Array(items)))
    }

    pub fn contains(column: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::new(column, FilterOperator::Contains, FieldValue::String(needle.into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sort {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Filters, optional sort and optional page window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub sort: Option<Sort>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(Sort {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Run a query over an already-fetched record set
pub fn apply(records: Vec<Record>, query: &Query) -> Vec<Record> {
    let mut selected: Vec<Record> = records
        .into_iter()
        .filter(|r| query.filters.iter().all(|f| matches(r, f)))
        .collect();

    if let Some(sort) = &query.sort {
        // Vec::sort_by is stable: ties keep their original order
        selected.sort_by(|a, b| compare_for_sort(a.get(&sort.column), b.get(&sort.column), sort.direction));
    }

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(usize::MAX);
    selected.into_iter().skip(offset).take(limit).collect()
}

/// Whether a single record passes a single filter
pub fn matches(record: &Record, filter: &Filter) -> bool {
    let field = record.get(&filter.column).unwrap_or(&FieldValue::Null);

    match filter.operator {
        FilterOperator::Eq => values_equal(field, &filter.value),
        FilterOperator::Ne => !values_equal(field, &filter.value),
        FilterOperator::Gt => compare_values(field, &filter.value) == Some(Ordering::Greater),
        FilterOperator::Gte => matches!(
            compare_values(field, &filter.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::Lt => compare_values(field, &filter.value) == Some(Ordering::Less),
        FilterOperator::Lte => matches!(
            compare_values(field, &filter.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOperator::In => match &filter.value {
            FieldValue::Json(serde_json::Value::Array(items)) => items
                .iter()
                .any(|item| values_equal(field, &FieldValue::from(item.clone()))),
            _ => false,
        },
        FilterOperator::Contains => match (field, &filter.value) {
            (FieldValue::String(haystack), FieldValue::String(needle)) => {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            }
            _ => false,
        },
    }
}

/// Equality after coercion: numbers, then dates, then booleans, then text
pub fn values_equal(a: &FieldValue, b: &FieldValue) -> bool {
    if a.is_empty() || b.is_empty() {
        return a.is_empty() && b.is_empty();
    }
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (coerce_number(a), coerce_number(b)) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (coerce_date(a), coerce_date(b)) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (coerce_bool(a), coerce_bool(b)) {
        return x == y;
    }
    a.to_string() == b.to_string()
}

/// Ordering for range filters. Only numbers and dates compare; anything
/// else yields `None`, which makes the filter not match.
pub fn compare_values(a: &FieldValue, b: &FieldValue) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (coerce_number(a), coerce_number(b)) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (coerce_date(a), coerce_date(b)) {
        return Some(x.cmp(&y));
    }
    None
}

/// Total order used for sorting. Missing values go last in both
/// directions; values of different kinds are grouped by kind.
fn compare_for_sort(a: Option<&FieldValue>, b: Option<&FieldValue>, direction: SortDirection) -> Ordering {
    let a = a.filter(|v| !v.is_empty());
    let b = b.filter(|v| !v.is_empty());

    let (a, b) = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Greater,
        (Some(_), None) => return Ordering::Less,
        (Some(a), Some(b)) => (a, b),
    };

    let ordering = match (sort_rank(a), sort_rank(b)) {
        (ra, rb) if ra != rb => ra.cmp(&rb),
        _ => compare_values(a, b)
            .or_else(|| coerce_bool(a).zip(coerce_bool(b)).map(|(x, y)| x.cmp(&y)))
            .unwrap_or_else(|| a.to_string().to_lowercase().cmp(&b.to_string().to_lowercase())),
    };

    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

fn sort_rank(value: &FieldValue) -> u8 {
    if coerce_number(value).is_some() {
        0
    } else if coerce_date(value).is_some() {
        1
    } else if coerce_bool(value).is_some() {
        2
    } else {
        3
    }
}

fn field_to_json(value: &FieldValue) -> serde_json::Value {
    match value {
        FieldValue::Json(v) => v.clone(),
        FieldValue::Null => serde_json::Value::Null,
        FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
        FieldValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        other => serde_json::Value::String(other.to_string()),
    }
}
