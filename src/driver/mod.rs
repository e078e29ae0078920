//! Driver Module
//!
//! The orchestrator that runs a driver instance, together with the shutdown
//! protocol, the metrics endpoint and the metrics it serves.

pub mod https;
pub mod metrics;
pub mod orchestrator;
pub mod shutdown;

pub use https::start_https_server;
pub use metrics::{DriverMetrics, MetricsHandler, ProtocolMetrics};
pub use orchestrator::Orchestrator;
pub use shutdown::{termination_signal, wait_for_termination, ForceStopGuard, Termination};
