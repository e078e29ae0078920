//! Domain Ports - Collaborator trait definitions for the driver
//!
//! The orchestrator only knows the shape of its collaborators. These traits
//! are that shape; `k8s`, `device`, `state` and `grpc` hold the adapters the
//! binary wires in, tests plug in fakes.

use crate::config::{DeviceMode, NodeSelector};
use crate::driver::metrics::ProtocolMetrics;
use crate::error::Result;
use async_trait::async_trait;
use prometheus::core::Collector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Watched Resource Kinds
// =============================================================================

/// Cluster object kinds tracked by the shared watch set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Claims,
    StorageClasses,
    Volumes,
    CsiNodes,
    Nodes,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Claims => write!(f, "PersistentVolumeClaim"),
            ResourceKind::StorageClasses => write!(f, "StorageClass"),
            ResourceKind::Volumes => write!(f, "PersistentVolume"),
            ResourceKind::CsiNodes => write!(f, "CSINode"),
            ResourceKind::Nodes => write!(f, "Node"),
        }
    }
}

// =============================================================================
// Cluster Backend Port
// =============================================================================

/// Port for everything the controller and conversion modes need from the cluster
#[async_trait]
pub trait ClusterBackend: Send + Sync + 'static {
    type Client: Clone + Send + Sync + 'static;
    type Factory: WatchFactory;
    type Rescheduler: Rescheduler;

    /// Connect to the API server with client-side rate limiting
    async fn connect(&self, qps: f64, burst: u32) -> Result<Self::Client>;

    /// Discover the API server's version string
    async fn server_version(&self, client: &Self::Client) -> Result<String>;

    /// Create the shared watch-set factory. Nothing is watched until it is started.
    fn new_watch_factory(&self, client: &Self::Client) -> Self::Factory;

    /// Create the rescheduler. May register additional watchers, which is
    /// why it takes the factory before it has been started.
    fn new_rescheduler(
        &self,
        driver_name: &str,
        client: &Self::Client,
        factory: &mut Self::Factory,
        selector: &NodeSelector,
        server_version: &str,
    ) -> Self::Rescheduler;

    /// Convert raw namespaces on `node_id` and relabel the node
    async fn force_convert_raw_namespaces(
        &self,
        token: &CancellationToken,
        client: &Self::Client,
        driver_name: &str,
        selector: Option<&NodeSelector>,
        node_id: &str,
    ) -> Result<()>;
}

/// A watch set that is still accepting registrations
pub trait WatchFactory: Send + 'static {
    type Started: SyncedWatchSet;

    /// Register a watcher for `kind`. Registering a kind twice is a no-op.
    fn register(&mut self, kind: ResourceKind);

    /// Start every registered watcher. Consumes the factory, so nothing can
    /// be registered afterwards.
    fn start(self, token: CancellationToken) -> Self::Started;
}

/// A started watch set
#[async_trait]
pub trait SyncedWatchSet: Send + Sync + 'static {
    /// Block until every watcher has populated its cache or `token` is
    /// cancelled. Returns the sync result per kind.
    async fn wait_for_sync(&self, token: &CancellationToken) -> BTreeMap<ResourceKind, bool>;
}

/// Control loop that releases volumes pinned to unsuitable nodes
pub trait Rescheduler: Send + 'static {
    /// Start the control loop. The loop stops when `token` is cancelled and
    /// may itself cancel `token` to request process shutdown.
    fn start(self, token: CancellationToken);
}

// =============================================================================
// Node Backend Port
// =============================================================================

/// Port for the collaborators of the node driver
#[async_trait]
pub trait NodeBackend: Send + Sync + 'static {
    type Server: ServiceLifecycle;

    /// Create the storage-protocol server. Not started yet.
    fn new_server(&self) -> Self::Server;

    async fn device_manager(
        &self,
        token: &CancellationToken,
        mode: DeviceMode,
        pmem_percentage: u32,
    ) -> Result<Arc<dyn DeviceManager>>;

    async fn state_store(&self, base_path: &Path) -> Result<Arc<dyn StateStore>>;
}

/// Capacity of the persistent memory managed on a node, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Largest volume that can currently be created
    pub max_volume_size: u64,
    /// Sum of all free space
    pub available: u64,
    /// Space the driver is allowed to use
    pub managed: u64,
    /// All of the installed PMEM
    pub total: u64,
}

/// Port for the device manager
#[async_trait]
pub trait DeviceManager: Send + Sync {
    async fn get_capacity(&self) -> Result<Capacity>;

    /// Adapter exporting the capacity as Prometheus metrics
    fn capacity_collector(&self, node_id: &str, driver_name: &str) -> Box<dyn Collector>;
}

/// Synchronous capacity lookup, as needed by metric collection
pub trait CapacitySource: Send + Sync {
    fn capacity(&self) -> Result<Capacity>;
}

/// Port for persisting node driver state
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create(&self, id: &str, data: &serde_json::Value) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<serde_json::Value>>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list_ids(&self) -> Result<Vec<String>>;
}

// =============================================================================
// Storage Protocol Port
// =============================================================================

/// Status codes reported by protocol calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    NotFound,
    Unimplemented,
    Unavailable,
    Internal,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::InvalidArgument => "InvalidArgument",
            StatusCode::NotFound => "NotFound",
            StatusCode::Unimplemented => "Unimplemented",
            StatusCode::Unavailable => "Unavailable",
            StatusCode::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Failed protocol call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unimplemented(service: &str, method: &str) -> Self {
        Self::new(
            StatusCode::Unimplemented,
            format!("unknown method {}/{}", service, method),
        )
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::Internal, err.to_string())
    }
}

/// One of the storage-protocol services (identity, node, controller)
#[async_trait]
pub trait ProtocolService: Send + Sync {
    /// Fully qualified service name, e.g. `csi.v1.Identity`
    fn name(&self) -> &'static str;

    async fn call(
        &self,
        method: &str,
        request: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, Status>;
}

/// Start/graceful-stop/force-stop/wait contract of the protocol endpoint
#[async_trait]
pub trait ServiceLifecycle: Send + Sync + 'static {
    /// Bind `endpoint` and serve `services` in the background
    async fn start(
        &self,
        token: &CancellationToken,
        endpoint: &str,
        node_id: &str,
        metrics: ProtocolMetrics,
        services: Vec<Arc<dyn ProtocolService>>,
    ) -> Result<()>;

    /// Stop accepting and let in-flight calls finish
    fn stop(&self);

    /// Stop accepting and abort in-flight calls. Idempotent.
    fn force_stop(&self);

    /// Wait until the server has fully stopped. Returns at once if it never started.
    async fn wait(&self);
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DeviceManagerRef = Arc<dyn DeviceManager>;
pub type StateStoreRef = Arc<dyn StateStore>;
pub type ProtocolServiceRef = Arc<dyn ProtocolService>;
