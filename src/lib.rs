//! PMEM-CSI Driver - Runtime Orchestrator
//!
//! One binary, three roles. Depending on its configured mode an instance
//! either serves the CSI protocol on a node, runs the cluster-wide
//! controller that releases volumes pinned to unsuitable nodes, or converts
//! raw namespaces on a node once and then idles until terminated.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Driver Orchestrator                          │
//! │     mode dispatch · shared cancellation token · two-phase stop       │
//! ├───────────────────────┬───────────────────────┬──────────────────────┤
//! │      node mode        │   controller mode     │  force-convert mode  │
//! │  ┌─────────────────┐  │  ┌─────────────────┐  │  ┌────────────────┐  │
//! │  │  CSI endpoint   │  │  │   watch set     │  │  │ node relabel   │  │
//! │  │ Identity/Node/  │  │  │ (sync barrier)  │  │  └────────────────┘  │
//! │  │  Controller     │  │  ├─────────────────┤  │                      │
//! │  ├─────────────────┤  │  │   rescheduler   │  │                      │
//! │  │ device manager  │  │  └─────────────────┘  │                      │
//! │  │  state store    │  │                       │                      │
//! │  └─────────────────┘  │                       │                      │
//! ├───────────────────────┴───────────────────────┴──────────────────────┤
//! │                 Prometheus endpoint (optional, any mode)             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`driver`]: Orchestrator, shutdown protocol and metrics endpoint
//! - [`config`]: Driver configuration and validation
//! - [`grpc`]: CSI endpoint server lifecycle and transport
//! - [`csi`]: CSI services
//! - [`k8s`]: Kubernetes watch set, rescheduler and node relabelling
//! - [`device`]: Device managers and capacity metrics
//! - [`state`]: Persistent node state
//! - [`domain`]: Collaborator traits
//! - [`error`]: Error types and handling

pub mod config;
pub mod csi;
pub mod device;
pub mod domain;
pub mod driver;
pub mod error;
pub mod grpc;
pub mod k8s;
pub mod state;

// Re-export commonly used types
pub use config::{Config, DeviceMode, DriverConfig, DriverMode, NodeSelector};

pub use domain::ports::{
    Capacity, ClusterBackend, DeviceManager, NodeBackend, ProtocolService, Rescheduler,
    ResourceKind, ServiceLifecycle, StateStore, Status, StatusCode, SyncedWatchSet, WatchFactory,
};

pub use driver::{DriverMetrics, Orchestrator, ProtocolMetrics, Termination};

pub use error::{Error, ErrorClass, Result};

pub use device::{FakeDeviceManager, LocalNodeBackend};
pub use grpc::NonBlockingServer;
pub use k8s::KubeBackend;
pub use state::FileState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
