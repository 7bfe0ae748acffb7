use std::fmt;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stats;

/// A per-document metric value as returned by a task's metric function.
///
/// Scalars and fixed-width tuples travel across ranks as numeric tensors; everything else
/// travels as an opaque JSON object.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Tuple(Vec<f64>),
    Opaque(Value),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Scalar(_) => MetricKind::Scalar,
            MetricValue::Tuple(values) => MetricKind::Tuple(values.len()),
            MetricValue::Opaque(_) => MetricKind::Opaque,
        }
    }

    /// Numeric view used by the built-in aggregations.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(value) => Some(*value),
            MetricValue::Opaque(Value::Number(number)) => number.as_f64(),
            MetricValue::Opaque(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
            MetricValue::Tuple(_) | MetricValue::Opaque(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Scalar(value)
    }
}

impl From<bool> for MetricValue {
    fn from(value: bool) -> Self {
        MetricValue::Scalar(if value { 1.0 } else { 0.0 })
    }
}

impl From<Value> for MetricValue {
    fn from(value: Value) -> Self {
        MetricValue::Opaque(value)
    }
}

/// How a metric's values are transferred between ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Scalar,
    Tuple(usize),
    Opaque,
}

impl MetricKind {
    /// Width of a numeric row, excluding the trailing doc id column.
    pub fn numeric_width(self) -> Option<usize> {
        match self {
            MetricKind::Scalar => Some(1),
            MetricKind::Tuple(width) => Some(width),
            MetricKind::Opaque => None,
        }
    }
}

/// A `(metric, filter)` pair. Rendered as `metric,filter` in result tables.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct MetricKey {
    pub metric: String,
    pub filter: String,
}

impl MetricKey {
    pub fn new(metric: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            filter: filter.into(),
        }
    }

    pub fn stderr_key(&self) -> String {
        format!("{}_stderr,{}", self.metric, self.filter)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.metric, self.filter)
    }
}

pub type AggregationFn = Arc<dyn Fn(&[MetricValue]) -> Result<f64> + Send + Sync>;

/// How a task folds its per-document values of one metric into a single number.
#[derive(Clone)]
pub enum Aggregation {
    Mean,
    Median,
    /// Used for predict-only runs: no aggregate is computed.
    Bypass,
    Custom {
        name: String,
        func: AggregationFn,
        /// Whether a bootstrap standard error is meaningful for this aggregation.
        bootstrap: bool,
    },
}

impl fmt::Debug for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Mean => f.write_str("Mean"),
            Aggregation::Median => f.write_str("Median"),
            Aggregation::Bypass => f.write_str("Bypass"),
            Aggregation::Custom {
                name, bootstrap, ..
            } => f
                .debug_struct("Custom")
                .field("name", name)
                .field("bootstrap", bootstrap)
                .finish_non_exhaustive(),
        }
    }
}

fn numeric_values(items: &[MetricValue]) -> Result<Vec<f64>> {
    items
        .iter()
        .map(|item| {
            item.as_f64()
                .ok_or_else(|| anyhow!("expected a numeric metric value, got {item:?}"))
        })
        .collect()
}

impl Aggregation {
    pub fn custom(
        name: impl Into<String>,
        bootstrap: bool,
        func: impl Fn(&[MetricValue]) -> Result<f64> + Send + Sync + 'static,
    ) -> Self {
        Aggregation::Custom {
            name: name.into(),
            func: Arc::new(func),
            bootstrap,
        }
    }

    fn apply(&self, items: &[MetricValue]) -> Result<f64> {
        match self {
            Aggregation::Mean => stats::mean(&numeric_values(items)?)
                .ok_or_else(|| anyhow!("cannot take the mean of zero values")),
            Aggregation::Median => stats::median(&numeric_values(items)?)
                .ok_or_else(|| anyhow!("cannot take the median of zero values")),
            Aggregation::Custom { func, .. } => func(items),
            Aggregation::Bypass => bail!("bypass aggregation has no numeric value"),
        }
    }

    /// Folds the values into the aggregate reported in the results table.
    pub fn aggregate(&self, items: &[MetricValue]) -> Result<Value> {
        if matches!(self, Aggregation::Bypass) {
            return Ok(Value::Null);
        }
        let value = self.apply(items)?;
        Ok(serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number))
    }

    /// Standard error of the aggregate, or `None` when it is not estimated.
    ///
    /// The mean uses the closed-form sample standard error; other bootstrappable
    /// aggregations are resampled `bootstrap_iters` times with a fixed seed.
    pub fn stderr(&self, items: &[MetricValue], bootstrap_iters: usize) -> Result<Option<f64>> {
        if bootstrap_iters == 0 || items.len() < 2 {
            return Ok(None);
        }
        match self {
            Aggregation::Mean => Ok(stats::mean_stderr(&numeric_values(items)?)),
            Aggregation::Median => {
                let values = numeric_values(items)?;
                stats::bootstrap_stderr(&values, bootstrap_iters, |sample| {
                    stats::median(sample).ok_or_else(|| anyhow!("empty bootstrap sample"))
                })
            }
            Aggregation::Custom {
                func,
                bootstrap: true,
                ..
            } => stats::bootstrap_stderr(items, bootstrap_iters, |sample| func(sample)),
            Aggregation::Custom {
                bootstrap: false, ..
            }
            | Aggregation::Bypass => Ok(None),
        }
    }
}
