use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::codec::coerce_number;
use super::types::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// Statistics for one field over a record set.
///
/// `count` is the number of records considered. `numeric` of those held a
/// usable number, `skipped` held something non-numeric and `missing` had no
/// value at all. `avg`/`min`/`max` are `None` when nothing was numeric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub field: String,
    pub count: usize,
    pub numeric: usize,
    pub sum: f64,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub skipped: usize,
    pub missing: usize,
}

impl AggregateSummary {
    fn empty(field: &str) -> Self {
        AggregateSummary {
            field: field.to_string(),
            count: 0,
            numeric: 0,
            sum: 0.0,
            avg: None,
            min: None,
            max: None,
            skipped: 0,
            missing: 0,
        }
    }

    pub fn value(&self, function: AggregateFunction) -> Option<f64> {
        match function {
            AggregateFunction::Count => Some(self.count as f64),
            AggregateFunction::Sum => Some(self.sum),
            AggregateFunction::Avg => self.avg,
            AggregateFunction::Min => self.min,
            AggregateFunction::Max => self.max,
        }
    }

    fn add(&mut self, record: &Record) {
        self.count += 1;
        let Some(value) = record.get(&self.field).filter(|v| !v.is_empty()) else {
            self.missing += 1;
            return;
        };

        match coerce_number(value) {
            Some(n) => {
                self.numeric += 1;
                self.sum += n;
                self.min = Some(self.min.map_or(n, |m| m.min(n)));
                self.max = Some(self.max.map_or(n, |m| m.max(n)));
            }
            None => {
                tracing::debug!(field = %self.field, value = %value, "skipping non-numeric value");
                self.skipped += 1;
            }
        }
    }

    fn finish(mut self) -> Self {
        if self.numeric > 0 {
            self.avg = Some(self.sum / self.numeric as f64);
        }
        self
    }
}

/// Count/sum/avg/min/max of `field` over `records`. Malformed values are
/// counted as skipped instead of failing the whole computation.
pub fn aggregate(records: &[Record], field: &str) -> AggregateSummary {
    let mut summary = AggregateSummary::empty(field);
    for record in records {
        summary.add(record);
    }
    if summary.skipped > 0 {
        tracing::warn!(field, skipped = summary.skipped, "non-numeric values left out of aggregate");
    }
    summary.finish()
}

/// Aggregate `field` separately for each distinct value of `group_field`.
/// Records without a group value fall under the empty key.
pub fn aggregate_by(records: &[Record], group_field: &str, field: &str) -> BTreeMap<String, AggregateSummary> {
    let mut groups: BTreeMap<String, AggregateSummary> = BTreeMap::new();

    for record in records {
        let key = record
            .get(group_field)
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
            .unwrap_or_default();
        groups
            .entry(key)
            .or_insert_with(|| AggregateSummary::empty(field))
            .add(record);
    }

    groups.into_iter().map(|(k, s)| (k, s.finish())).collect()
}
