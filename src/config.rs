//! Driver Configuration
//!
//! Raw startup parameters ([`DriverConfig`]) as collected by the CLI, and the
//! validated, immutable [`Config`] the orchestrator runs with.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Parent directory of the node state when no state path is configured
pub const DEFAULT_STATE_ROOT: &str = "/var/lib";

/// Pause between a termination signal and closing the protocol socket
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Driver Mode
// =============================================================================

/// Which sub-services an instance runs.
///
/// The string forms are part of the metrics API and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverMode {
    /// Node driver with support for provisioning
    #[serde(rename = "node")]
    Node,
    /// The controller with the rescheduler. For historic reasons this is called "webhooks".
    #[serde(rename = "webhooks")]
    Controller,
    /// Convert each raw namespace into fsdax
    #[serde(rename = "force-convert-raw-namespaces")]
    ForceConvertRawNamespaces,
}

impl DriverMode {
    pub const ALL: [DriverMode; 3] = [
        DriverMode::Node,
        DriverMode::Controller,
        DriverMode::ForceConvertRawNamespaces,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverMode::Node => "node",
            DriverMode::Controller => "webhooks",
            DriverMode::ForceConvertRawNamespaces => "force-convert-raw-namespaces",
        }
    }
}

impl std::fmt::Display for DriverMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DriverMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| Error::UnsupportedMode(s.to_string()))
    }
}

// =============================================================================
// Device Mode
// =============================================================================

/// Which device manager backs the node driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Lvm,
    Direct,
    Fake,
}

impl std::fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceMode::Lvm => write!(f, "lvm"),
            DeviceMode::Direct => write!(f, "direct"),
            DeviceMode::Fake => write!(f, "fake"),
        }
    }
}

impl FromStr for DeviceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lvm" => Ok(DeviceMode::Lvm),
            "direct" => Ok(DeviceMode::Direct),
            "fake" => Ok(DeviceMode::Fake),
            other => Err(Error::Configuration(format!("invalid device mode '{}'", other))),
        }
    }
}

// =============================================================================
// Node Selector
// =============================================================================

/// Node labels identifying nodes that should run the node driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeSelector(pub BTreeMap<String, String>);

impl NodeSelector {
    /// Parse a selector given as a JSON object, e.g. `{"storage": "pmem"}`
    pub fn from_json(value: &str) -> Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| Error::Configuration(format!("invalid node selector {:?}: {}", value, e)))
    }

    /// Check whether a set of node labels satisfies every selector entry
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(key, value)| {
            labels
                .and_then(|labels| labels.get(key))
                .map_or(false, |actual| actual == value)
        })
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl std::fmt::Display for NodeSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", pairs.join(","))
    }
}

// =============================================================================
// Raw Configuration
// =============================================================================

/// Startup parameters before validation
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Name of the CSI driver
    pub driver_name: String,
    /// Node on which this driver instance is running
    pub node_id: String,
    /// Exported CSI endpoint
    pub endpoint: String,
    /// Driver mode, one of the [`DriverMode`] strings
    pub mode: String,
    /// Device manager to use
    pub device_manager: DeviceMode,
    /// Directory where to persist the node driver state
    pub state_base_path: Option<PathBuf>,
    /// Driver release version
    pub version: String,
    /// Percentage of space to be used by the driver in each PMEM region
    pub pmem_percentage: u32,
    /// Average rate of requests to the API server, enforced locally
    pub kube_api_qps: f64,
    /// Number of requests allowed above the average rate
    pub kube_api_burst: u32,
    /// Used by the rescheduler and raw namespace conversion
    pub node_selector: Option<NodeSelector>,
    /// Listen address for the Prometheus endpoint
    pub metrics_listen: Option<String>,
    pub metrics_path: String,
    /// Sleep between a termination signal and the graceful stop
    pub termination_grace: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: "pmem-csi.intel.com".to_string(),
            node_id: String::new(),
            endpoint: "unix:///tmp/pmem-csi.sock".to_string(),
            mode: DriverMode::Node.to_string(),
            device_manager: DeviceMode::Lvm,
            state_base_path: None,
            version: crate::VERSION.to_string(),
            pmem_percentage: 100,
            kube_api_qps: 5.0,
            kube_api_burst: 10,
            node_selector: None,
            metrics_listen: None,
            metrics_path: "/metrics".to_string(),
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }
}

impl DriverConfig {
    /// Check required fields and fill in derived defaults.
    ///
    /// Has no side effects; the caller decides what to publish.
    pub fn validate(self) -> Result<Config> {
        if self.driver_name.is_empty() {
            return Err(Error::Configuration(
                "driver name configuration option missing".into(),
            ));
        }
        if self.endpoint.is_empty() {
            return Err(Error::Configuration(
                "CSI endpoint configuration option missing".into(),
            ));
        }

        let is_node = DriverMode::from_str(&self.mode).ok() == Some(DriverMode::Node);
        if is_node && self.node_id.is_empty() {
            return Err(Error::Configuration(
                "node ID configuration option missing".into(),
            ));
        }
        if self.pmem_percentage > 100 {
            return Err(Error::Configuration(format!(
                "PMEM percentage must be in the range 0 to 100, got {}",
                self.pmem_percentage
            )));
        }
        if !(self.kube_api_qps > 0.0 && self.kube_api_qps.is_finite()) {
            return Err(Error::Configuration(format!(
                "Kubernetes API QPS must be positive and finite, got {}",
                self.kube_api_qps
            )));
        }
        if self.kube_api_burst == 0 {
            return Err(Error::Configuration(
                "Kubernetes API burst must be at least 1".into(),
            ));
        }
        if !self.metrics_path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "metrics path must start with '/', got {:?}",
                self.metrics_path
            )));
        }

        let state_base_path = match self.state_base_path {
            Some(path) if !path.as_os_str().is_empty() => path,
            _ if is_node => PathBuf::from(DEFAULT_STATE_ROOT).join(&self.driver_name),
            _ => PathBuf::new(),
        };

        let topology_key = topology_key(&self.driver_name);

        Ok(Config {
            driver_name: self.driver_name,
            node_id: self.node_id,
            endpoint: self.endpoint,
            mode: self.mode,
            device_manager: self.device_manager,
            state_base_path,
            version: self.version,
            pmem_percentage: self.pmem_percentage,
            kube_api_qps: self.kube_api_qps,
            kube_api_burst: self.kube_api_burst,
            node_selector: self.node_selector,
            metrics_listen: self.metrics_listen.filter(|listen| !listen.is_empty()),
            metrics_path: self.metrics_path,
            termination_grace: self.termination_grace,
            topology_key,
        })
    }
}

/// Topology key for a driver name, used for topology constraints
pub fn topology_key(driver_name: &str) -> String {
    format!("{}/node", driver_name)
}

// =============================================================================
// Validated Configuration
// =============================================================================

/// Validated driver configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct Config {
    driver_name: String,
    node_id: String,
    endpoint: String,
    mode: String,
    device_manager: DeviceMode,
    state_base_path: PathBuf,
    version: String,
    pmem_percentage: u32,
    kube_api_qps: f64,
    kube_api_burst: u32,
    node_selector: Option<NodeSelector>,
    metrics_listen: Option<String>,
    metrics_path: String,
    termination_grace: Duration,
    topology_key: String,
}

impl Config {
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The configured mode string, as given
    pub fn mode_name(&self) -> &str {
        &self.mode
    }

    /// The configured mode, `None` if the mode string is not supported
    pub fn mode(&self) -> Option<DriverMode> {
        DriverMode::from_str(&self.mode).ok()
    }

    pub fn device_manager(&self) -> DeviceMode {
        self.device_manager
    }

    pub fn state_base_path(&self) -> &std::path::Path {
        &self.state_base_path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn pmem_percentage(&self) -> u32 {
        self.pmem_percentage
    }

    pub fn kube_api_qps(&self) -> f64 {
        self.kube_api_qps
    }

    pub fn kube_api_burst(&self) -> u32 {
        self.kube_api_burst
    }

    pub fn node_selector(&self) -> Option<&NodeSelector> {
        self.node_selector.as_ref()
    }

    pub fn metrics_listen(&self) -> Option<&str> {
        self.metrics_listen.as_deref()
    }

    pub fn metrics_path(&self) -> &str {
        &self.metrics_path
    }

    pub fn termination_grace(&self) -> Duration {
        self.termination_grace
    }

    /// `<driver name>/node`
    pub fn topology_key(&self) -> &str {
        &self.topology_key
    }
}
