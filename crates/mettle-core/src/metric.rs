//! The `Metric` value type flowing through the whole pipeline.
//!
//! A metric is created by a collector, copied into every eligible handler's
//! channel by the dispatcher and only ever touched again when a handler merges
//! its default dimensions and prefix into it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension tags attached to a metric. Keys are unique.
pub type Dimensions = BTreeMap<String, String>;

/// Aggregation semantics of a metric value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Instantaneous value.
    #[default]
    Gauge,
    /// Count of events since the previous report.
    Counter,
    /// Monotonically non-decreasing total.
    CumulativeCounter,
    /// Distribution summary value.
    Histogram,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
            MetricType::CumulativeCounter => "cumulative_counter",
            MetricType::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error decoding or encoding the wire form of a metric.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("invalid metric JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metric name must not be empty")]
    EmptyName,
}

fn default_buffered() -> bool {
    true
}

/// One observed `(name, type, value, dimensions, time)` tuple.
///
/// Equality is structural over name, type, value, dimensions and timestamp.
/// The `buffered` flag only steers retention in query-style handlers and does
/// not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(rename = "type", default)]
    pub metric_type: MetricType,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub dimensions: Dimensions,
    #[serde(rename = "time", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_buffered")]
    pub buffered: bool,
}

impl Metric {
    /// Creates a gauge with value 0, no dimensions and the current time.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metric_type: MetricType::Gauge,
            value: 0.0,
            dimensions: Dimensions::new(),
            timestamp: Utc::now(),
            buffered: true,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn with_type(mut self, metric_type: MetricType) -> Self {
        self.metric_type = metric_type;
        self
    }

    /// Prepends `prefix` to the name.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        if !prefix.is_empty() {
            self.name.insert_str(0, prefix);
        }
        self
    }

    /// Adds or replaces a dimension.
    pub fn add_dimension(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.dimensions.insert(key.into(), value.into());
    }

    /// Adds every dimension from `dims`, replacing existing keys.
    pub fn add_dimensions(&mut self, dims: &Dimensions) {
        for (k, v) in dims {
            self.dimensions.insert(k.clone(), v.clone());
        }
    }

    pub fn dimension(&self, key: &str) -> Option<&str> {
        self.dimensions.get(key).map(String::as_str)
    }

    /// Returns the metric's dimensions merged over `defaults`.
    ///
    /// The metric's own values win on key collisions; `self` is not modified.
    pub fn dimensions_with(&self, defaults: &Dimensions) -> Dimensions {
        let mut merged = defaults.clone();
        for (k, v) in &self.dimensions {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Marks the metric as retained by query-style handlers.
    pub fn enable_buffering(&mut self) {
        self.buffered = true;
    }

    /// Marks the metric as bypassing the retention window of query-style handlers.
    pub fn disable_buffering(&mut self) {
        self.buffered = false;
    }

    /// Serializes the metric to its JSON wire form.
    pub fn to_json(&self) -> Result<String, MetricError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a metric from its JSON wire form.
    pub fn from_json(raw: &str) -> Result<Self, MetricError> {
        let metric: Metric = serde_json::from_str(raw)?;
        if metric.name.is_empty() {
            return Err(MetricError::EmptyName);
        }
        Ok(metric)
    }
}

impl PartialEq for Metric {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.metric_type == other.metric_type
            && self.value == other.value
            && self.dimensions == other.dimensions
            && self.timestamp == other.timestamp
    }
}

/// Predicate over metrics: anchored name pattern, optional type and a
/// required subset of dimensions.
#[derive(Debug, Clone)]
pub struct Filter {
    name: Regex,
    metric_type: Option<MetricType>,
    dimensions: Dimensions,
}

impl Filter {
    /// Builds a filter. `pattern` must match the whole metric name.
    pub fn new(
        pattern: &str,
        metric_type: Option<MetricType>,
        dimensions: Dimensions,
    ) -> Result<Self, regex::Error> {
        let name = Regex::new(&format!("^(?:{pattern})$"))?;
        Ok(Self {
            name,
            metric_type,
            dimensions,
        })
    }

    pub fn matches(&self, metric: &Metric) -> bool {
        if !self.name.is_match(&metric.name) {
            return false;
        }
        if let Some(t) = self.metric_type
            && t != metric.metric_type
        {
            return false;
        }
        self.dimensions
            .iter()
            .all(|(k, v)| metric.dimension(k) == Some(v.as_str()))
    }
}
