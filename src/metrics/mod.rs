use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::error;


lazy_static! {
    pub static ref BATCHES_SUBMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("batches_submitted", "External batches accepted by the server"),
        &["server"]
    )
    .expect("metric can not be created");

    pub static ref EXTERNAL_RESPONSES: IntCounterVec = IntCounterVec::new(
        Opts::new("external_responses", "Responses delivered to external callers"),
        &["server", "type", "result"]
    )
    .expect("metric can not be created");

    pub static ref LOCK_CONTENTION: IntCounterVec = IntCounterVec::new(
        Opts::new("lock_contention", "External requests held back by a conflicting lock"),
        &["server"]
    )
    .expect("metric can not be created");

    pub static ref PROPERTY_RESETS: IntCounterVec = IntCounterVec::new(
        Opts::new("property_resets", "Properties reset after a panic in property code"),
        &["server", "property"]
    )
    .expect("metric can not be created");

    pub static ref PROTOCOL_VIOLATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("protocol_violations", "Request/response protocol violations"),
        &["server", "kind"]
    )
    .expect("metric can not be created");

    pub static ref CACHE_LOOKUPS: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_lookups", "Memory cache reads by outcome"),
        &["server", "result"]
    )
    .expect("metric can not be created");

    pub static ref OUTSTANDING_REQUESTS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("outstanding_requests", "Requests currently tracked by the server"),
        &["server"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        register_custom_metrics(&registry);
        registry
    };
}

/// Registers every broker collector with `registry`.
///
/// Registering twice with the same registry is logged and ignored.
pub fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BATCHES_SUBMITTED.clone()),
        Box::new(EXTERNAL_RESPONSES.clone()),
        Box::new(LOCK_CONTENTION.clone()),
        Box::new(PROPERTY_RESETS.clone()),
        Box::new(PROTOCOL_VIOLATIONS.clone()),
        Box::new(CACHE_LOOKUPS.clone()),
        Box::new(OUTSTANDING_REQUESTS.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            error!("collector can not be registered: {:?}", e);
        }
    }
}

/// Text exposition of [`REGISTRY`] for Prometheus to scrape.
pub fn metrics_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
        return String::default();
    }
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}
