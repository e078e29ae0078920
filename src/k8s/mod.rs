//! Kubernetes Integration
//!
//! API client, shared watch set, volume rescheduler and node relabelling
//! used by the controller and conversion modes.

pub mod client;
pub mod convert;
pub mod rescheduler;
pub mod watch;

pub use client::{new_client, KubeBackend};
pub use rescheduler::PvcRescheduler;
pub use watch::{KubeWatchFactory, KubeWatchSet};
