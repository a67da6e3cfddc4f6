//! mettle-core - shared library for the mettle telemetry agent.
//!
//! Provides:
//! - `metric` - the `Metric` value type, wire form and filters
//! - `collector` - collector framework, leader cache, tree parser and collector variants
//! - `dispatch` - fan-out from collectors to handlers
//! - `handler` - handler framework, ring buffer and handler variants
//! - `agent` - wiring of the whole pipeline from a configuration
//! - `config` - configuration file model and lenient option helpers
//! - `status` - status report model shared by the status server and collector
//! - `util` - helper utilities

pub mod agent;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod handler;
pub mod metric;
pub mod status;
pub mod util;

pub use metric::{Dimensions, Filter, Metric, MetricType};

/// Crate version, reported by the daemon at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
