//! Transfer metrics
//!
//! Recorded through the `metrics` facade; the embedding application decides
//! whether and where to export them.

use metrics::{describe_counter, describe_gauge, describe_histogram};

/// Metric names as constants
pub mod names {
    // RPC metrics
    pub const RPC_CALLS: &str = "rexcas_rpc_calls_total";
    pub const RPC_FAILURES: &str = "rexcas_rpc_failures_total";
    pub const RPC_DURATION: &str = "rexcas_rpc_duration_seconds";
    pub const RETRIES: &str = "rexcas_retries_total";

    // Transfer metrics
    pub const BYTES_UPLOADED: &str = "rexcas_bytes_uploaded_total";
    pub const BYTES_DOWNLOADED: &str = "rexcas_bytes_downloaded_total";
    pub const BLOBS_SKIPPED: &str = "rexcas_blobs_already_present_total";
    pub const ITEM_FAILURES: &str = "rexcas_item_failures_total";
    pub const MISSING_RATIO: &str = "rexcas_missing_blob_ratio";

    // Concurrency
    pub const INFLIGHT: &str = "rexcas_inflight_operations";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_counter!(names::RPC_CALLS, "Remote calls issued, by RPC");
    describe_counter!(
        names::RPC_FAILURES,
        "Remote calls that failed or timed out, by RPC"
    );
    describe_histogram!(names::RPC_DURATION, "Remote call duration in seconds");
    describe_counter!(names::RETRIES, "Retries scheduled after transient failures");

    describe_counter!(names::BYTES_UPLOADED, "Blob bytes sent to the store");
    describe_counter!(names::BYTES_DOWNLOADED, "Blob bytes received from the store");
    describe_counter!(
        names::BLOBS_SKIPPED,
        "Upload candidates the store already held"
    );
    describe_counter!(names::ITEM_FAILURES, "Digests that failed permanently");
    describe_histogram!(
        names::MISSING_RATIO,
        "Fraction of upload candidates reported missing"
    );

    describe_gauge!(names::INFLIGHT, "Batch and stream operations in flight");
}
