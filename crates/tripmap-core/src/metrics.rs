//! Prometheus metrics helpers for tripmap.
//!
//! The ingest engine records through the `metrics` facade; without an
//! installed recorder every call is a no-op. Batch runs install a Prometheus
//! recorder with [`init_metrics`] and render the exposition text once the run
//! is over.
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`ingest_`)
//! - Suffix: unit or type (`_total`)

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed for this process.
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Register descriptions for the ingest metrics.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    describe_counter!("ingest_fixes_total", "GPS fixes read from all trips");
    describe_counter!(
        "ingest_fixes_unusable_total",
        "GPS fixes skipped for lacking a time or latitude"
    );
    describe_counter!("ingest_packets_total", "Packets read from all interfaces");
    describe_counter!(
        "ingest_packets_stale_total",
        "Packets discarded for being older than the staleness window"
    );
    describe_counter!(
        "ingest_packets_unplaced_total",
        "Due packets dropped because their fix had no longitude"
    );
    describe_counter!(
        "ingest_records_joined_total",
        "Packets joined to a covering fix"
    );
    describe_counter!(
        "ingest_records_duplicate_total",
        "Joined records dropped because their address was already mapped"
    );
    describe_counter!(
        "ingest_records_inserted_total",
        "Joined records inserted into the time map"
    );
    describe_counter!(
        "ingest_stream_failures_total",
        "Source streams that ended early on an open or decode error"
    );
    describe_gauge!(
        "ingest_time_map_buckets",
        "Number of timestamp buckets in the most recent time map"
    );
}
