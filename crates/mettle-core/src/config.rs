//! Agent configuration file and lenient option readers.
//!
//! Component options are plain JSON objects. Values are read leniently: a
//! number may arrive as `10`, `10.0` or `"10"`, and a list either as a JSON
//! array or a comma-separated string.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::metric::Dimensions;

/// Options of a single collector or handler.
pub type Options = serde_json::Map<String, Value>;

/// Default port of the internal status server.
pub const DEFAULT_STATUS_PORT: u16 = 9090;

/// Default path of the internal status server.
pub const DEFAULT_STATUS_PATH: &str = "/metrics";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Settings of the embedded status HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct InternalServerConfig {
    #[serde(default = "default_status_port")]
    pub port: u16,
    #[serde(default = "default_status_path")]
    pub path: String,
}

impl Default for InternalServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_STATUS_PORT,
            path: DEFAULT_STATUS_PATH.to_string(),
        }
    }
}

fn default_status_port() -> u16 {
    DEFAULT_STATUS_PORT
}

fn default_status_path() -> String {
    DEFAULT_STATUS_PATH.to_string()
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Prefix prepended to every metric name by every handler.
    #[serde(default)]
    pub prefix: String,
    /// Global handler interval in seconds (number or numeric string).
    #[serde(default)]
    pub interval: Option<Value>,
    /// Dimensions merged into every metric by every handler.
    #[serde(default)]
    pub default_dimensions: Dimensions,
    #[serde(default)]
    pub internal_server: InternalServerConfig,
    /// Collector name → options.
    #[serde(default)]
    pub collectors: BTreeMap<String, Options>,
    /// Handler name → options.
    #[serde(default)]
    pub handlers: BTreeMap<String, Options>,
}

impl AgentConfig {
    /// Loads a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Global handler interval in seconds, if set and readable.
    pub fn interval_secs(&self) -> Option<u64> {
        self.interval
            .as_ref()
            .and_then(as_int)
            .and_then(|i| u64::try_from(i).ok())
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Reads an integer from a number or numeric string, `default` otherwise.
pub fn get_as_int(value: &Value, default: i64) -> i64 {
    as_int(value).unwrap_or(default)
}

/// Reads a float from a number or numeric string, `default` otherwise.
pub fn get_as_float(value: &Value, default: f64) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(default),
        Value::String(s) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

/// Reads a string; numbers and booleans are rendered as text.
pub fn get_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Reads an object of string-ish values. Non-string values are skipped.
pub fn get_as_map(value: &Value) -> BTreeMap<String, String> {
    let Value::Object(obj) = value else {
        return BTreeMap::new();
    };
    obj.iter()
        .filter_map(|(k, v)| get_as_string(v).map(|s| (k.clone(), s)))
        .collect()
}

/// Reads a list of strings from an array or a comma-separated string.
pub fn get_as_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(get_as_string).collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
