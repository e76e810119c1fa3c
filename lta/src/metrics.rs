//! Pipeline-wide Prometheus metrics.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

pub static WORK_CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lta_work_cycles_total",
        "Number of work cycles executed, by component and outcome",
        &["component", "outcome"]
    )
    .expect("Failed to register lta_work_cycles_total counter")
});

pub static QUARANTINES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lta_quarantines_total",
        "Number of records sent to quarantine, by component and entity kind",
        &["component", "entity"]
    )
    .expect("Failed to register lta_quarantines_total counter")
});

pub static BUNDLES_ARCHIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lta_bundles_archived_total",
        "Number of bundle archives built by this replica"
    )
    .expect("Failed to register lta_bundles_archived_total counter")
});

pub static BYTES_BUNDLED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lta_bytes_bundled_total",
        "Total size in bytes of the bundle archives built by this replica"
    )
    .expect("Failed to register lta_bytes_bundled_total counter")
});

pub static TRANSFERS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lta_transfers_total",
        "Number of transfers submitted, by terminal result",
        &["result"]
    )
    .expect("Failed to register lta_transfers_total counter")
});

pub static CHECKSUM_MISMATCHES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lta_checksum_mismatches_total",
        "Number of bundles whose destination checksum differed from creation"
    )
    .expect("Failed to register lta_checksum_mismatches_total counter")
});

pub static FILES_DELETED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "lta_files_deleted_total",
        "Number of warehouse files removed after confirmed archival"
    )
    .expect("Failed to register lta_files_deleted_total counter")
});

/// Render the default registry in the Prometheus text exposition format.
pub fn gather_text() -> anyhow::Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}
