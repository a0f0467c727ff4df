use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

lazy_static! {
    /// Builds reaching a terminal status, labelled by that status.
    pub static ref BUILDS_COMPLETED: IntCounterVec = register_int_counter_vec!(
        "kiln_builds_completed_total",
        "Builds which reached a terminal status",
        &["status"]
    )
    .unwrap();

    /// Packages reaching a terminal status, labelled by that status.
    pub static ref PACKAGES_COMPLETED: IntCounterVec = register_int_counter_vec!(
        "kiln_packages_completed_total",
        "Package jobs which reached a terminal status",
        &["status"]
    )
    .unwrap();

    /// Successful claims of a ready package.
    pub static ref CLAIMS: IntCounter = register_int_counter!(
        "kiln_claims_total",
        "Ready packages claimed for execution"
    )
    .unwrap();

    /// Packages currently waiting (pending or blocked) across active builds.
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "kiln_queue_depth",
        "Packages waiting to run across active builds"
    )
    .unwrap();

    /// Executions currently occupying each backend.
    pub static ref BACKEND_OCCUPANCY: IntGaugeVec = register_int_gauge_vec!(
        "kiln_backend_occupancy",
        "Executions currently running on each backend",
        &["backend"]
    )
    .unwrap();

    /// Wall-clock seconds per output-directory sync to storage.
    pub static ref STORAGE_SYNC_SECONDS: Histogram = register_histogram!(
        "kiln_storage_sync_seconds",
        "Latency of output directory syncs to storage",
        vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0]
    )
    .unwrap();

    /// API requests served, labelled by route and response status.
    pub static ref API_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "kiln_api_requests_total",
        "API requests served",
        &["path", "status"]
    )
    .unwrap();
}

/// Render the default registry in the Prometheus text exposition format.
pub fn gather() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}
