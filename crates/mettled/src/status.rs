//! Internal status endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use mettle_core::status::{AgentStats, MetricGroup, StatusReport};

/// Builds the router serving the status document at `path`.
pub fn router(stats: Arc<AgentStats>, path: &str) -> Router {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    Router::new().route(&path, get(report)).with_state(stats)
}

async fn report(State(stats): State<Arc<AgentStats>>) -> Json<StatusReport> {
    Json(stats.report(memory_stats()))
}

#[cfg(not(target_env = "msvc"))]
fn read_jemalloc(name: &std::ffi::CStr) -> Option<usize> {
    let mut value: usize = 0;
    let mut len = std::mem::size_of::<usize>();
    // SAFETY: `name` is a NUL-terminated size_t statistic and `value`/`len`
    // describe a buffer of exactly that size.
    let rc = unsafe {
        tikv_jemalloc_sys::mallctl(
            name.as_ptr(),
            (&mut value as *mut usize).cast(),
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    (rc == 0).then_some(value)
}

/// Allocator statistics as gauges, refreshed on every call.
#[cfg(not(target_env = "msvc"))]
pub fn memory_stats() -> MetricGroup {
    let mut epoch: u64 = 1;
    // SAFETY: writing the epoch refreshes jemalloc's cached statistics.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"epoch".as_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            (&mut epoch as *mut u64).cast(),
            std::mem::size_of::<u64>(),
        );
    }

    let mut group = MetricGroup::default();
    for (gauge, stat) in [
        ("allocated", c"stats.allocated"),
        ("active", c"stats.active"),
        ("resident", c"stats.resident"),
    ] {
        if let Some(v) = read_jemalloc(stat) {
            group = group.gauge(gauge, v as f64);
        }
    }
    group
}

#[cfg(target_env = "msvc")]
pub fn memory_stats() -> MetricGroup {
    MetricGroup::default()
}
