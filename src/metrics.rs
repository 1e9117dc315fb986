// Prometheus metrics for vmkeeper
//
// Exposed on the API server's /metrics endpoint:
// - Lifecycle operations by kind and outcome (counter, histogram)
// - Running VMs (gauge)
// - Pulls, active pulls and pull duration
// - Blob cache hits, downloads and downloaded bytes

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // VM lifecycle metrics
    pub static ref VM_OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("vm_operations_total", "Total lifecycle operations by kind and outcome"),
        &["operation", "status"]
    ).expect("Failed to create VM operations metric");

    pub static ref VM_OPERATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("vm_operation_duration_seconds", "Lifecycle operation duration in seconds"),
        &["operation"]
    ).expect("Failed to create VM operation duration metric");

    pub static ref RUNNING_VMS: IntGauge = IntGauge::new(
        "running_vms",
        "Number of VMs started by this process and not yet stopped"
    ).expect("Failed to create running VMs metric");

    // Pull metrics
    pub static ref PULLS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("image_pulls_total", "Total image pulls by outcome"),
        &["status"]
    ).expect("Failed to create pulls metric");

    pub static ref ACTIVE_PULLS: IntGauge = IntGauge::new(
        "image_pulls_active",
        "Number of pulls in progress"
    ).expect("Failed to create active pulls metric");

    pub static ref PULL_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("image_pull_duration_seconds", "Image pull duration in seconds")
            .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
    ).expect("Failed to create pull duration metric");

    // Content cache metrics
    pub static ref BLOB_CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "blob_cache_hits_total",
        "Parts served from the content cache"
    ).expect("Failed to create cache hits metric");

    pub static ref BLOB_DOWNLOADS_TOTAL: IntCounter = IntCounter::new(
        "blob_downloads_total",
        "Parts downloaded from the registry"
    ).expect("Failed to create blob downloads metric");

    pub static ref BLOB_BYTES_DOWNLOADED_TOTAL: IntCounter = IntCounter::new(
        "blob_bytes_downloaded_total",
        "Compressed bytes downloaded from the registry"
    ).expect("Failed to create downloaded bytes metric");
}

/// Register every metric with `REGISTRY`. Safe to call more than once.
pub fn init() -> prometheus::Result<()> {
    register(Box::new(VM_OPERATIONS_TOTAL.clone()))?;
    register(Box::new(VM_OPERATION_DURATION_SECONDS.clone()))?;
    register(Box::new(RUNNING_VMS.clone()))?;
    register(Box::new(PULLS_TOTAL.clone()))?;
    register(Box::new(ACTIVE_PULLS.clone()))?;
    register(Box::new(PULL_DURATION_SECONDS.clone()))?;
    register(Box::new(BLOB_CACHE_HITS_TOTAL.clone()))?;
    register(Box::new(BLOB_DOWNLOADS_TOTAL.clone()))?;
    register(Box::new(BLOB_BYTES_DOWNLOADED_TOTAL.clone()))?;
    Ok(())
}

fn register(collector: Box<dyn prometheus::core::Collector>) -> prometheus::Result<()> {
    match REGISTRY.register(collector) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Record the outcome and duration of one lifecycle operation.
pub fn record_operation(operation: &str, success: bool, seconds: f64) {
    let status = if success { "success" } else { "failure" };
    VM_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
    VM_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(seconds);
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
