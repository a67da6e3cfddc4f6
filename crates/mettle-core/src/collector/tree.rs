//! Flattening of dropwizard-style nested metric trees.
//!
//! Internal objects are namespace segments; an object carrying a string
//! `type` (or a `unit` of seconds/milliseconds) is a measurement block. Each numeric field of
//! an accepted block becomes one metric named by the joined path, with a
//! `rollup` dimension naming the field.
//!
//! ```text
//! {"jvm": {"heap": {"type": "gauge", "value": 12}}}   →   jvm.heap{rollup=value} = 12
//! ```
//!
//! Block classification:
//! - `gauge`: every numeric field, gauge type
//! - `histogram`, `counter`: only with a `count` field, typed as the block
//! - `meter`: requires `event_type` and `unit` in seconds/milliseconds/minutes;
//!   `count` is a counter, everything else a gauge
//! - anything else with `unit` in seconds/milliseconds: treated like a meter
//!   without the `event_type` requirement
//! - otherwise the block contributes nothing

use serde_json::{Map, Value};
use thiserror::Error;

use crate::metric::{Metric, MetricType};

/// Dimension naming the block field a metric was derived from.
pub const ROLLUP_DIMENSION: &str = "rollup";

/// Keys describing a block rather than measuring anything.
const RESERVED_KEYS: [&str; 3] = ["type", "unit", "event_type"];

/// Error type for metric tree parsing.
#[derive(Debug, Error)]
pub enum TreeParseError {
    #[error("malformed metric tree: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metric tree root must be a JSON object")]
    NotAnObject,
}

/// Parses a raw JSON payload and flattens it into metrics.
pub fn parse_metric_tree(raw: &[u8]) -> Result<Vec<Metric>, TreeParseError> {
    match serde_json::from_slice::<Value>(raw)? {
        Value::Object(root) => Ok(flatten(&root)),
        _ => Err(TreeParseError::NotAnObject),
    }
}

/// Flattens an already decoded tree. The root is always a namespace.
pub fn flatten(root: &Map<String, Value>) -> Vec<Metric> {
    let mut results = Vec::new();
    let mut path = Vec::new();
    walk_children(root, &mut path, &mut results);
    results
}

fn walk_children(node: &Map<String, Value>, path: &mut Vec<String>, out: &mut Vec<Metric>) {
    for (key, child) in node {
        let Value::Object(child) = child else {
            continue;
        };
        path.push(key.clone());
        if is_measurement_block(child) {
            out.extend(collect_block(child, &path.join(".")));
        } else {
            walk_children(child, path, out);
        }
        path.pop();
    }
}

/// A string `type`, or a rate `unit` without one. Anything else is a
/// namespace, whatever other scalars it carries.
fn is_measurement_block(node: &Map<String, Value>) -> bool {
    matches!(node.get("type"), Some(Value::String(_)))
        || matches!(str_field(node, "unit"), Some("seconds" | "milliseconds"))
}

fn str_field<'a>(node: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    node.get(key).and_then(Value::as_str)
}

fn collect_block(node: &Map<String, Value>, name: &str) -> Vec<Metric> {
    match str_field(node, "type") {
        Some("gauge") => metrics_from_fields(node, name, |_| MetricType::Gauge),
        Some("histogram") if node.contains_key("count") => {
            metrics_from_fields(node, name, |_| MetricType::Histogram)
        }
        Some("counter") if node.contains_key("count") => {
            metrics_from_fields(node, name, |_| MetricType::Counter)
        }
        Some("histogram") | Some("counter") => Vec::new(),
        Some("meter") => {
            let unit = str_field(node, "unit");
            let has_meter_units = matches!(unit, Some("seconds" | "milliseconds" | "minutes"));
            if node.contains_key("event_type") && has_meter_units {
                metrics_from_fields(node, name, rate_type)
            } else {
                Vec::new()
            }
        }
        _ => {
            if matches!(str_field(node, "unit"), Some("seconds" | "milliseconds")) {
                metrics_from_fields(node, name, rate_type)
            } else {
                Vec::new()
            }
        }
    }
}

fn rate_type(key: &str) -> MetricType {
    if key == "count" {
        MetricType::Counter
    } else {
        MetricType::Gauge
    }
}

fn metrics_from_fields(
    node: &Map<String, Value>,
    name: &str,
    type_of: impl Fn(&str) -> MetricType,
) -> Vec<Metric> {
    if name.is_empty() {
        return Vec::new();
    }
    node.iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| {
            let value = value.as_f64()?;
            let mut m = Metric::new(name)
                .with_value(value)
                .with_type(type_of(key));
            m.add_dimension(ROLLUP_DIMENSION, key.as_str());
            Some(m)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Vec<Metric> {
        parse_metric_tree(raw.as_bytes()).unwrap()
    }

    fn find<'a>(metrics: &'a [Metric], name: &str, rollup: &str) -> &'a Metric {
        metrics
            .iter()
            .find(|m| m.name == name && m.dimension(ROLLUP_DIMENSION) == Some(rollup))
            .unwrap_or_else(|| panic!("{name}/{rollup} not found in {metrics:?}"))
    }

    #[test]
    fn test_siblings_do_not_leak_path() {
        let metrics = parse(
            r#"{"a": {"b": {"type": "gauge", "value": 1}},
                "c": {"d": {"type": "gauge", "value": 2}}}"#,
        );
        let mut names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a.b", "c.d"]);
        assert_eq!(find(&metrics, "a.b", "value").value, 1.0);
        assert_eq!(find(&metrics, "c.d", "value").value, 2.0);
    }

    #[test]
    fn test_deep_siblings_after_nested_branch() {
        let metrics = parse(
            r#"{"x": {"y": {"z": {"type": "gauge", "value": 1}},
                      "w": {"type": "gauge", "value": 2}}}"#,
        );
        let mut names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["x.w", "x.y.z"]);
    }

    #[test]
    fn test_gauge_block() {
        let metrics = parse(r#"{"jvm": {"heap": {"type": "gauge", "value": 12.5}}}"#);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "jvm.heap");
        assert_eq!(metrics[0].metric_type, MetricType::Gauge);
        assert_eq!(metrics[0].value, 12.5);
    }

    #[test]
    fn test_counter_and_histogram_require_count() {
        let metrics = parse(
            r#"{"c": {"type": "counter", "value": 3},
                "h": {"type": "histogram", "p99": 3, "max": 4}}"#,
        );
        assert!(metrics.is_empty());

        let metrics = parse(
            r#"{"c": {"type": "counter", "count": 3},
                "h": {"type": "histogram", "count": 10, "p99": 3}}"#,
        );
        assert_eq!(metrics.len(), 3);
        assert_eq!(find(&metrics, "c", "count").metric_type, MetricType::Counter);
        assert_eq!(find(&metrics, "h", "count").metric_type, MetricType::Histogram);
        assert_eq!(find(&metrics, "h", "p99").value, 3.0);
    }

    #[test]
    fn test_meter_requires_event_type() {
        let metrics = parse(
            r#"{"requests": {"type": "meter", "unit": "seconds", "count": 5, "m1_rate": 0.5}}"#,
        );
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_meter_requires_known_unit() {
        let metrics = parse(
            r#"{"requests": {"type": "meter", "unit": "hours", "event_type": "calls",
                             "count": 5, "m1_rate": 0.5}}"#,
        );
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_valid_meter_emits_every_field_once() {
        for unit in ["seconds", "milliseconds", "minutes"] {
            let raw = format!(
                r#"{{"requests": {{"type": "meter", "unit": "{unit}", "event_type": "calls",
                                  "count": 5, "m1_rate": 0.5, "mean_rate": 0.25}}}}"#
            );
            let metrics = parse(&raw);
            assert_eq!(metrics.len(), 3, "unit {unit}");
            assert_eq!(find(&metrics, "requests", "count").metric_type, MetricType::Counter);
            assert_eq!(find(&metrics, "requests", "m1_rate").metric_type, MetricType::Gauge);
            assert_eq!(find(&metrics, "requests", "mean_rate").value, 0.25);
            assert!(metrics.iter().all(|m| {
                let rollup = m.dimension(ROLLUP_DIMENSION).unwrap();
                !RESERVED_KEYS.contains(&rollup)
            }));
        }
    }

    #[test]
    fn test_implicit_rate_block() {
        let metrics = parse(
            r#"{"timers": {"db": {"unit": "milliseconds", "count": 7, "p50": 1.5}}}"#,
        );
        assert_eq!(metrics.len(), 2);
        assert_eq!(find(&metrics, "timers.db", "count").metric_type, MetricType::Counter);
        assert_eq!(find(&metrics, "timers.db", "p50").metric_type, MetricType::Gauge);

        let metrics = parse(r#"{"timers": {"db": {"unit": "minutes", "count": 7}}}"#);
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_non_rate_unit_without_type_is_a_namespace() {
        let metrics = parse(
            r#"{"svc": {"unit": "bytes", "heap": {"type": "gauge", "value": 7}},
                "db": {"unit": "minutes", "pool": {"unit": "seconds", "count": 1}}}"#,
        );
        let mut names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["db.pool", "svc.heap"]);
        assert_eq!(find(&metrics, "svc.heap", "value").value, 7.0);
    }

    #[test]
    fn test_unknown_type_with_rate_unit() {
        let metrics = parse(
            r#"{"t": {"type": "timer", "unit": "seconds", "count": 2, "max": 9}}"#,
        );
        assert_eq!(metrics.len(), 2);
    }

    #[test]
    fn test_plain_scalars_contribute_nothing() {
        let metrics = parse(r#"{"version": "1.2", "threads": {"count": 4, "daemon": 2}}"#);
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_non_numeric_fields_are_skipped() {
        let metrics = parse(r#"{"g": {"type": "gauge", "value": "n/a", "other": 3}}"#);
        assert_eq!(metrics.len(), 1);
        assert_eq!(find(&metrics, "g", "other").value, 3.0);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(matches!(
            parse_metric_tree(b"{not json"),
            Err(TreeParseError::Json(_))
        ));
        assert!(matches!(
            parse_metric_tree(b"[1, 2]"),
            Err(TreeParseError::NotAnObject)
        ));
    }
}
