//! Fake collaborators for orchestrator tests
//!
//! Every fake appends to a shared call log so tests can assert on ordering.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pmem_csi_driver::config::DeviceMode;
use pmem_csi_driver::domain::ports::{
    ClusterBackend, DeviceManagerRef, NodeBackend, ProtocolServiceRef, Rescheduler, ResourceKind,
    ServiceLifecycle, StateStoreRef, SyncedWatchSet, WatchFactory,
};
use pmem_csi_driver::{
    DriverConfig, DriverMetrics, Error, FakeDeviceManager, FileState, NodeSelector, ProtocolMetrics,
    Result,
};
use prometheus::Registry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DRIVER: &str = "pmem-csi.intel.com";

/// Ordered record of collaborator calls
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().iter().any(|e| e == entry)
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }
}

pub fn metrics() -> DriverMetrics {
    DriverMetrics::new(Registry::new()).unwrap()
}

pub fn node_config(tmp: &Path) -> DriverConfig {
    DriverConfig {
        node_id: "worker-1".into(),
        endpoint: format!("unix://{}", tmp.join("csi.sock").display()),
        device_manager: DeviceMode::Fake,
        state_base_path: Some(tmp.join("state")),
        version: "v1.2.3".into(),
        ..DriverConfig::default()
    }
}

pub fn controller_config() -> DriverConfig {
    DriverConfig {
        mode: "webhooks".into(),
        version: "v1.2.3".into(),
        ..DriverConfig::default()
    }
}

pub fn selector() -> NodeSelector {
    NodeSelector::from_json(r#"{"storage":"pmem"}"#).unwrap()
}

/// A signal that arrives after `delay`
pub async fn signal_after(delay: Duration) -> &'static str {
    tokio::time::sleep(delay).await;
    "SIGTERM"
}

// =============================================================================
// Cluster
// =============================================================================

#[derive(Clone, Default)]
pub struct FakeCluster {
    pub log: CallLog,
    pub fail_connect: bool,
    pub fail_convert: bool,
    /// Kinds whose cache never syncs
    pub unsynced: BTreeSet<ResourceKind>,
    /// Cancel the token this long after the rescheduler starts
    pub rescheduler_cancels_after: Option<Duration>,
}

#[async_trait]
impl ClusterBackend for FakeCluster {
    type Client = ();
    type Factory = FakeWatchFactory;
    type Rescheduler = FakeRescheduler;

    async fn connect(&self, _qps: f64, _burst: u32) -> Result<()> {
        self.log.push("connect");
        if self.fail_connect {
            return Err(Error::Internal("connection refused".into()));
        }
        Ok(())
    }

    async fn server_version(&self, _client: &()) -> Result<String> {
        self.log.push("server-version");
        Ok("v1.29.0".into())
    }

    fn new_watch_factory(&self, _client: &()) -> FakeWatchFactory {
        self.log.push("new-factory");
        FakeWatchFactory {
            log: self.log.clone(),
            registered: BTreeSet::new(),
            unsynced: self.unsynced.clone(),
        }
    }

    fn new_rescheduler(
        &self,
        _driver_name: &str,
        _client: &(),
        factory: &mut FakeWatchFactory,
        _selector: &NodeSelector,
        server_version: &str,
    ) -> FakeRescheduler {
        self.log.push(format!("new-rescheduler:{}", server_version));
        factory.register(ResourceKind::Nodes);
        FakeRescheduler {
            log: self.log.clone(),
            cancels_after: self.rescheduler_cancels_after,
        }
    }

    async fn force_convert_raw_namespaces(
        &self,
        _token: &CancellationToken,
        _client: &(),
        _driver_name: &str,
        _selector: Option<&NodeSelector>,
        node_id: &str,
    ) -> Result<()> {
        self.log.push(format!("convert:{}", node_id));
        if self.fail_convert {
            return Err(Error::Internal("no namespaces to convert".into()));
        }
        Ok(())
    }
}

pub struct FakeWatchFactory {
    log: CallLog,
    registered: BTreeSet<ResourceKind>,
    unsynced: BTreeSet<ResourceKind>,
}

impl WatchFactory for FakeWatchFactory {
    type Started = FakeWatchSet;

    fn register(&mut self, kind: ResourceKind) {
        if self.registered.insert(kind) {
            self.log.push(format!("register:{}", kind));
        }
    }

    fn start(self, _token: CancellationToken) -> FakeWatchSet {
        self.log.push("start-factory");
        FakeWatchSet {
            log: self.log,
            registered: self.registered,
            unsynced: self.unsynced,
        }
    }
}

pub struct FakeWatchSet {
    log: CallLog,
    registered: BTreeSet<ResourceKind>,
    unsynced: BTreeSet<ResourceKind>,
}

#[async_trait]
impl SyncedWatchSet for FakeWatchSet {
    async fn wait_for_sync(&self, _token: &CancellationToken) -> BTreeMap<ResourceKind, bool> {
        self.log.push("wait-for-sync");
        self.registered
            .iter()
            .map(|kind| (*kind, !self.unsynced.contains(kind)))
            .collect()
    }
}

pub struct FakeRescheduler {
    log: CallLog,
    cancels_after: Option<Duration>,
}

impl Rescheduler for FakeRescheduler {
    fn start(self, token: CancellationToken) {
        self.log.push("start-rescheduler");
        if let Some(delay) = self.cancels_after {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                token.cancel();
            });
        }
    }
}

// =============================================================================
// Node
// =============================================================================

#[derive(Default)]
pub struct ServerCalls {
    pub start: AtomicUsize,
    pub stop: AtomicUsize,
    pub force_stop: AtomicUsize,
    pub wait: AtomicUsize,
}

impl ServerCalls {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeServer {
    log: CallLog,
    calls: Arc<ServerCalls>,
    fail_start: bool,
}

#[async_trait]
impl ServiceLifecycle for FakeServer {
    async fn start(
        &self,
        _token: &CancellationToken,
        endpoint: &str,
        _node_id: &str,
        _metrics: ProtocolMetrics,
        services: Vec<ProtocolServiceRef>,
    ) -> Result<()> {
        self.calls.start.fetch_add(1, Ordering::SeqCst);
        let names: Vec<&str> = services.iter().map(|s| s.name()).collect();
        self.log.push(format!("server-start:{}", names.join(",")));
        if self.fail_start {
            return Err(Error::Internal(format!("cannot listen on {}", endpoint)));
        }
        Ok(())
    }

    fn stop(&self) {
        self.calls.stop.fetch_add(1, Ordering::SeqCst);
        self.log.push("server-stop");
    }

    fn force_stop(&self) {
        self.calls.force_stop.fetch_add(1, Ordering::SeqCst);
        self.log.push("server-force-stop");
    }

    async fn wait(&self) {
        self.calls.wait.fetch_add(1, Ordering::SeqCst);
        self.log.push("server-wait");
    }
}

#[derive(Clone, Default)]
pub struct FakeNode {
    pub log: CallLog,
    pub calls: Arc<ServerCalls>,
    pub fail_device: bool,
    pub fail_start: bool,
}

#[async_trait]
impl NodeBackend for FakeNode {
    type Server = FakeServer;

    fn new_server(&self) -> FakeServer {
        FakeServer {
            log: self.log.clone(),
            calls: self.calls.clone(),
            fail_start: self.fail_start,
        }
    }

    async fn device_manager(
        &self,
        _token: &CancellationToken,
        mode: DeviceMode,
        pmem_percentage: u32,
    ) -> Result<DeviceManagerRef> {
        self.log.push(format!("device-manager:{}", mode));
        if self.fail_device {
            return Err(Error::Configuration("no PMEM found".into()));
        }
        Ok(Arc::new(FakeDeviceManager::new(8 << 30, pmem_percentage)))
    }

    async fn state_store(&self, base_path: &Path) -> Result<StateStoreRef> {
        self.log.push("state-store");
        Ok(Arc::new(FileState::new(base_path).await?))
    }
}
