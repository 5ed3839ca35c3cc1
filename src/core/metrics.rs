// src/core/metrics.rs

//! Prometheus metrics for the Source Manager (spec §1.1 ambient stack):
//! gauges for slot usage, counters for downloads and refresh errors.
//! `lazy_static`-registered exactly once for the process lifetime, same
//! idiom as the teacher's own metrics module.

use lazy_static::lazy_static;
use prometheus::{register_counter, register_gauge, Counter, Gauge, TextEncoder};

lazy_static! {
    /// Slots currently occupied across all sources.
    pub static ref GLOBAL_USED_SLOTS: Gauge =
        register_gauge!("csaf_source_manager_global_used_slots", "Download slots currently in use across all sources.").unwrap();
    /// Total configured global slot budget.
    pub static ref GLOBAL_SLOTS: Gauge =
        register_gauge!("csaf_source_manager_global_slots", "Configured global download slot budget.").unwrap();

    /// Downloads dispatched to a worker.
    pub static ref DOWNLOADS_STARTED_TOTAL: Counter =
        register_counter!("csaf_source_manager_downloads_started_total", "Total number of downloads dispatched to a worker.").unwrap();
    /// Downloads that validated and persisted successfully.
    pub static ref DOWNLOADS_SUCCEEDED_TOTAL: Counter =
        register_counter!("csaf_source_manager_downloads_succeeded_total", "Total number of downloads stored successfully.").unwrap();
    /// Downloads rejected by validation or that failed to fetch.
    pub static ref DOWNLOADS_FAILED_TOTAL: Counter =
        register_counter!("csaf_source_manager_downloads_failed_total", "Total number of downloads that failed or were rejected.").unwrap();

    /// Feed refreshes that errored or timed out.
    pub static ref REFRESH_ERRORS_TOTAL: Counter =
        register_counter!("csaf_source_manager_refresh_errors_total", "Total number of feed refreshes that failed or timed out.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
