//! Device Manager Adapters
//!
//! Physical PMEM handling (LVM volume groups, direct namespaces) lives in the
//! device layer, outside of this crate. What is here is the in-memory fake
//! device manager used for testing deployments, the Prometheus adapter for
//! device capacity, and the node backend wiring them up.

use crate::config::DeviceMode;
use crate::domain::ports::{
    Capacity, CapacitySource, DeviceManager, DeviceManagerRef, NodeBackend, StateStoreRef,
};
use crate::error::{Error, Result};
use crate::grpc::NonBlockingServer;
use crate::state::FileState;
use async_trait::async_trait;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntGauge, Opts};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// PMEM size pretended by the fake device manager
pub const DEFAULT_FAKE_CAPACITY: u64 = 32 << 30;

// =============================================================================
// Fake Device Manager
// =============================================================================

/// Device manager without real hardware. Reports a fixed amount of PMEM.
pub struct FakeDeviceManager {
    capacity: Arc<FixedCapacity>,
}

struct FixedCapacity(Capacity);

impl CapacitySource for FixedCapacity {
    fn capacity(&self) -> Result<Capacity> {
        Ok(self.0)
    }
}

impl FakeDeviceManager {
    /// Pretend `total` bytes of PMEM, of which `percentage` are managed
    pub fn new(total: u64, percentage: u32) -> Self {
        let managed = (u128::from(total) * u128::from(percentage.min(100)) / 100) as u64;
        Self {
            capacity: Arc::new(FixedCapacity(Capacity {
                max_volume_size: managed,
                available: managed,
                managed,
                total,
            })),
        }
    }
}

#[async_trait]
impl DeviceManager for FakeDeviceManager {
    async fn get_capacity(&self) -> Result<Capacity> {
        self.capacity.capacity()
    }

    fn capacity_collector(&self, node_id: &str, driver_name: &str) -> Box<dyn Collector> {
        let source: Arc<dyn CapacitySource> = self.capacity.clone();
        match CapacityCollector::new(source, node_id, driver_name) {
            Ok(collector) => Box::new(collector),
            Err(e) => {
                warn!(error = %e, "Capacity metrics disabled");
                Box::new(EmptyCollector)
            }
        }
    }
}

// =============================================================================
// Capacity Collector
// =============================================================================

/// Exports device capacity as `pmem_amount_*` gauges
pub struct CapacityCollector {
    source: Arc<dyn CapacitySource>,
    available: IntGauge,
    managed: IntGauge,
    max_volume_size: IntGauge,
    total: IntGauge,
}

impl CapacityCollector {
    pub fn new(source: Arc<dyn CapacitySource>, node_id: &str, driver_name: &str) -> Result<Self> {
        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(
                Opts::new(name, help)
                    .const_label("node", node_id)
                    .const_label("driver_name", driver_name),
            )
        };

        Ok(Self {
            source,
            available: gauge(
                "pmem_amount_available",
                "Remaining amount of PMEM on the host that can be used for new volumes.",
            )?,
            managed: gauge(
                "pmem_amount_managed",
                "Amount of PMEM on the host that is managed by PMEM-CSI.",
            )?,
            max_volume_size: gauge(
                "pmem_amount_max_volume_size",
                "The size of the largest PMEM volume that can be created.",
            )?,
            total: gauge(
                "pmem_amount_total",
                "Total amount of PMEM on the host.",
            )?,
        })
    }

    fn gauges(&self) -> [&IntGauge; 4] {
        [&self.available, &self.managed, &self.max_volume_size, &self.total]
    }
}

impl Collector for CapacityCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.gauges().into_iter().flat_map(|g| g.desc()).collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let capacity = match self.source.capacity() {
            Ok(capacity) => capacity,
            Err(e) => {
                warn!(error = %e, "Failed to read PMEM capacity");
                return Vec::new();
            }
        };

        self.available.set(saturating_i64(capacity.available));
        self.managed.set(saturating_i64(capacity.managed));
        self.max_volume_size.set(saturating_i64(capacity.max_volume_size));
        self.total.set(saturating_i64(capacity.total));

        self.gauges().into_iter().flat_map(|g| g.collect()).collect()
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Stand-in when the capacity gauges cannot be built
struct EmptyCollector;

impl Collector for EmptyCollector {
    fn desc(&self) -> Vec<&Desc> {
        Vec::new()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        Vec::new()
    }
}

// =============================================================================
// Node Backend
// =============================================================================

/// Node collaborators available in this build
#[derive(Debug, Clone)]
pub struct LocalNodeBackend {
    /// PMEM size pretended in `fake` device mode
    pub fake_capacity: u64,
}

impl Default for LocalNodeBackend {
    fn default() -> Self {
        Self {
            fake_capacity: DEFAULT_FAKE_CAPACITY,
        }
    }
}

#[async_trait]
impl NodeBackend for LocalNodeBackend {
    type Server = NonBlockingServer;

    fn new_server(&self) -> NonBlockingServer {
        NonBlockingServer::new()
    }

    async fn device_manager(
        &self,
        _token: &CancellationToken,
        mode: DeviceMode,
        pmem_percentage: u32,
    ) -> Result<DeviceManagerRef> {
        match mode {
            DeviceMode::Fake => {
                info!(capacity = self.fake_capacity, pmem_percentage, "Using fake device manager");
                Ok(Arc::new(FakeDeviceManager::new(
                    self.fake_capacity,
                    pmem_percentage,
                )))
            }
            other => Err(Error::Configuration(format!(
                "device mode '{}' is not available in this build",
                other
            ))),
        }
    }

    async fn state_store(&self, base_path: &Path) -> Result<StateStoreRef> {
        Ok(Arc::new(FileState::new(base_path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use prometheus::Registry;

    #[tokio::test]
    async fn test_fake_capacity_applies_percentage() {
        let dm = FakeDeviceManager::new(1000, 50);
        let capacity = dm.get_capacity().await.unwrap();
        assert_eq!(capacity.total, 1000);
        assert_eq!(capacity.managed, 500);
        assert_eq!(capacity.available, 500);
    }

    #[test]
    fn test_capacity_collector_reports_gauges() {
        let dm = FakeDeviceManager::new(2000, 100);
        let registry = Registry::new();
        registry
            .register(dm.capacity_collector("worker-1", "pmem-csi.intel.com"))
            .unwrap();

        let families = registry.gather();
        let total = families
            .iter()
            .find(|f| f.get_name() == "pmem_amount_total")
            .unwrap();
        let metric = &total.get_metric()[0];
        assert_eq!(metric.get_gauge().get_value(), 2000.0);
        let labels: Vec<(&str, &str)> = metric
            .get_label()
            .iter()
            .map(|l| (l.get_name(), l.get_value()))
            .collect();
        assert!(labels.contains(&("node", "worker-1")));
        assert!(labels.contains(&("driver_name", "pmem-csi.intel.com")));
    }

    #[tokio::test]
    async fn test_unavailable_device_modes() {
        let backend = LocalNodeBackend::default();
        let token = CancellationToken::new();
        let err = backend
            .device_manager(&token, DeviceMode::Lvm, 100)
            .await
            .err()
            .unwrap();
        assert_matches!(err, Error::Configuration(msg) if msg.contains("lvm"));
    }
}
