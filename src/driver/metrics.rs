//! Driver Metrics
//!
//! Prometheus registries the driver exposes:
//! - the process-wide registry, injected by the caller, which receives
//!   `build_info`, scrape instrumentation and collectors of sub-services
//! - a "simple" registry exposing only `build_info`
//! - one [`ProtocolMetrics`] registry per node driver for CSI call latencies

use crate::domain::ports::StatusCode;
use crate::error::Result;
use hyper::{Body, Response};
use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Driver Metrics
// =============================================================================

/// Process-level metrics shared by every orchestrator in the process.
///
/// Construct once per registry and clone it into each orchestrator.
#[derive(Clone)]
pub struct DriverMetrics {
    registry: Registry,
    simple: Registry,
    build_info: GaugeVec,
    handler_requests: IntCounterVec,
}

impl DriverMetrics {
    /// Register the driver's own metrics in `registry`
    pub fn new(registry: Registry) -> Result<Self> {
        let build_info = GaugeVec::new(
            Opts::new(
                "build_info",
                "A metric with a constant '1' value labeled by version.",
            ),
            &["version"],
        )?;
        let handler_requests = IntCounterVec::new(
            Opts::new(
                "promhttp_metric_handler_requests_total",
                "Total number of scrapes by HTTP status code.",
            ),
            &["code"],
        )?;

        registry.register(Box::new(build_info.clone()))?;
        registry.register(Box::new(handler_requests.clone()))?;

        let simple = Registry::new();
        simple.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            simple,
            build_info,
            handler_requests,
        })
    }

    /// Record the running version. Each call adds or refreshes one sample.
    pub fn record_version(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1.0);
    }

    /// The process-wide registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registry holding only build information
    pub fn simple_registry(&self) -> &Registry {
        &self.simple
    }
}

// =============================================================================
// Protocol Metrics
// =============================================================================

/// Latency of storage-protocol calls, labeled by method and status
#[derive(Clone)]
pub struct ProtocolMetrics {
    registry: Registry,
    operations: HistogramVec,
    driver_name: String,
}

impl ProtocolMetrics {
    pub fn new(driver_name: &str) -> Result<Self> {
        let operations = HistogramVec::new(
            HistogramOpts::new(
                "operations_seconds",
                "Container Storage Interface operation duration with gRPC error code status total",
            )
            .namespace("csi")
            .subsystem("plugin")
            .buckets(vec![
                0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 25.0, 50.0, 120.0, 300.0, 600.0,
            ]),
            &["driver_name", "method_name", "grpc_status_code"],
        )?;

        let registry = Registry::new();
        registry.register(Box::new(operations.clone()))?;

        Ok(Self {
            registry,
            operations,
            driver_name: driver_name.to_string(),
        })
    }

    /// Observe one finished call of `/<service>/<method>`
    pub fn record(&self, method: &str, code: StatusCode, elapsed: Duration) {
        self.operations
            .with_label_values(&[&self.driver_name, method, &code.to_string()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

// =============================================================================
// Gathering
// =============================================================================

/// Gather from several registries, merging families that share a name.
///
/// A family whose type differs from an earlier one of the same name is
/// dropped, as is a series whose label set was already gathered.
pub fn gather_all(gatherers: &[Registry]) -> Vec<MetricFamily> {
    let mut families: BTreeMap<String, MetricFamily> = BTreeMap::new();
    let mut seen: BTreeSet<(String, Vec<(String, String)>)> = BTreeSet::new();

    for registry in gatherers {
        for mut family in registry.gather() {
            let name = family.get_name().to_string();
            let metrics = family.take_metric();
            let existing = families.entry(name.clone()).or_insert(family.clone());
            if existing.get_field_type() != family.get_field_type() {
                warn!(name = %name, "Dropping metric family with conflicting type");
                continue;
            }

            for metric in metrics.into_iter() {
                let labels = metric
                    .get_label()
                    .iter()
                    .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
                    .collect();
                if seen.insert((name.clone(), labels)) {
                    existing.mut_metric().push(metric);
                } else {
                    warn!(name = %name, "Dropping duplicate metric series");
                }
            }
        }
    }

    families.into_values().collect()
}

// =============================================================================
// Metrics Handler
// =============================================================================

/// Serves `<path>` from all gatherers and `<path>/simple` from the simple registry
#[derive(Clone)]
pub struct MetricsHandler {
    path: String,
    simple_path: String,
    gatherers: Vec<Registry>,
    metrics: DriverMetrics,
}

impl MetricsHandler {
    pub fn new(path: &str, gatherers: Vec<Registry>, metrics: DriverMetrics) -> Self {
        Self {
            path: path.to_string(),
            simple_path: format!("{}/simple", path),
            gatherers,
            metrics,
        }
    }

    pub fn handle(&self, path: &str) -> Response<Body> {
        if path == self.path {
            let response = encode(&gather_all(&self.gatherers));
            self.metrics
                .handler_requests
                .with_label_values(&[response.status().as_str()])
                .inc();
            response
        } else if path == self.simple_path {
            encode(&self.metrics.simple.gather())
        } else {
            plain(hyper::StatusCode::NOT_FOUND, "404 page not found\n")
        }
    }
}

fn encode(families: &[MetricFamily]) -> Response<Body> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return plain(hyper::StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics\n");
    }

    Response::builder()
        .status(hyper::StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn plain(status: hyper::StatusCode, text: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_text(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_record_version_is_repeatable() {
        let metrics = DriverMetrics::new(Registry::new()).unwrap();
        metrics.record_version("v1.0.0");
        metrics.record_version("v1.0.0");
        metrics.record_version("v1.1.0");

        let families = metrics.simple_registry().gather();
        let build_info = families
            .iter()
            .find(|f| f.get_name() == "build_info")
            .unwrap();
        assert_eq!(build_info.get_metric().len(), 2);
    }

    #[test]
    fn test_second_registration_in_same_registry_fails() {
        let registry = Registry::new();
        DriverMetrics::new(registry.clone()).unwrap();
        assert!(DriverMetrics::new(registry).is_err());
    }

    #[test]
    fn test_gather_all_merges_registries() {
        let metrics = DriverMetrics::new(Registry::new()).unwrap();
        metrics.record_version("v1");
        let protocol = ProtocolMetrics::new("pmem-csi.intel.com").unwrap();
        protocol.record(
            "/csi.v1.Identity/Probe",
            StatusCode::Ok,
            Duration::from_millis(3),
        );

        let families = gather_all(&[
            metrics.registry().clone(),
            protocol.registry().clone(),
        ]);
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"build_info"));
        assert!(names.contains(&"csi_plugin_operations_seconds"));
    }

    #[test]
    fn test_gather_all_drops_duplicate_series() {
        let first = DriverMetrics::new(Registry::new()).unwrap();
        let second = DriverMetrics::new(Registry::new()).unwrap();
        first.record_version("v1");
        second.record_version("v1");
        second.record_version("v2");

        let families = gather_all(&[first.registry().clone(), second.registry().clone()]);
        let build_info = families
            .iter()
            .find(|f| f.get_name() == "build_info")
            .unwrap();
        let versions: Vec<&str> = build_info
            .get_metric()
            .iter()
            .map(|m| m.get_label()[0].get_value())
            .collect();
        assert_eq!(versions, vec!["v1", "v2"]);
    }

    #[test]
    fn test_gather_all_drops_conflicting_type() {
        let gauges = Registry::new();
        let gauge = prometheus::IntGauge::new("pmem_test", "as gauge").unwrap();
        gauges.register(Box::new(gauge.clone())).unwrap();
        gauge.set(3);

        let counters = Registry::new();
        let counter = prometheus::IntCounter::new("pmem_test", "as counter").unwrap();
        counters.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let families = gather_all(&[gauges, counters]);
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_metric().len(), 1);
        assert_eq!(families[0].get_metric()[0].get_gauge().get_value(), 3.0);
    }

    #[tokio::test]
    async fn test_handler_paths() {
        let metrics = DriverMetrics::new(Registry::new()).unwrap();
        metrics.record_version("v9");
        let handler = MetricsHandler::new(
            "/metrics",
            vec![metrics.registry().clone()],
            metrics.clone(),
        );

        let full = body_text(handler.handle("/metrics")).await;
        assert!(full.contains("build_info{version=\"v9\"} 1"));

        let simple = body_text(handler.handle("/metrics/simple")).await;
        assert!(simple.contains("build_info"));
        assert!(!simple.contains("promhttp_metric_handler_requests_total"));

        // The first scrape has been counted by now.
        let again = body_text(handler.handle("/metrics")).await;
        assert!(again.contains("promhttp_metric_handler_requests_total{code=\"200\"} 1"));

        let missing = handler.handle("/other");
        assert_eq!(missing.status(), hyper::StatusCode::NOT_FOUND);
    }
}
