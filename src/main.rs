//! PMEM-CSI Driver
//!
//! Runs one driver instance in node, controller (`webhooks`) or
//! raw-namespace conversion mode until SIGINT/SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pmem_csi_driver::{
    DeviceMode, DriverConfig, DriverMetrics, KubeBackend, LocalNodeBackend, NodeSelector,
    Orchestrator, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// PMEM-CSI Driver - persistent memory for Kubernetes volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the driver
    #[arg(long = "drivername", env = "DRIVER_NAME", default_value = "pmem-csi.intel.com")]
    driver_name: String,

    /// Node ID
    #[arg(long = "nodeid", env = "KUBE_NODE_NAME", default_value = "")]
    node_id: String,

    /// CSI endpoint
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///tmp/pmem-csi.sock")]
    endpoint: String,

    /// Driver run mode: node, webhooks or force-convert-raw-namespaces
    #[arg(long, env = "PMEM_CSI_MODE", default_value = "node")]
    mode: String,

    /// Device manager to use to manage PMEM devices: lvm, direct or fake
    #[arg(long, env = "DEVICE_MANAGER", default_value = "lvm")]
    device_manager: String,

    /// Directory path where to persist the state of the driver
    #[arg(long = "statepath", env = "STATE_PATH")]
    state_path: Option<PathBuf>,

    /// Percentage of space to be used by the driver in each PMEM region
    #[arg(long, env = "PMEM_PERCENTAGE", default_value = "100")]
    pmem_percentage: u32,

    /// Queries per second to the apiserver
    #[arg(long, env = "KUBE_API_QPS", default_value = "5")]
    kube_api_qps: f64,

    /// Burst limit for queries to the apiserver
    #[arg(long, env = "KUBE_API_BURST", default_value = "10")]
    kube_api_burst: u32,

    /// Labels of nodes that run the node driver, as a JSON object
    #[arg(long, env = "NODE_SELECTOR")]
    node_selector: Option<String>,

    /// Listen address for the Prometheus endpoint, disabled when unset
    #[arg(long, env = "METRICS_LISTEN")]
    metrics_listen: Option<String>,

    /// Path of the Prometheus endpoint
    #[arg(long, env = "METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn driver_config(&self) -> Result<DriverConfig> {
        let device_manager: DeviceMode = self.device_manager.parse()?;
        let node_selector = self
            .node_selector
            .as_deref()
            .map(NodeSelector::from_json)
            .transpose()?;

        Ok(DriverConfig {
            driver_name: self.driver_name.clone(),
            node_id: self.node_id.clone(),
            endpoint: self.endpoint.clone(),
            mode: self.mode.clone(),
            device_manager,
            state_base_path: self.state_path.clone(),
            pmem_percentage: self.pmem_percentage,
            kube_api_qps: self.kube_api_qps,
            kube_api_burst: self.kube_api_burst,
            node_selector,
            metrics_listen: self.metrics_listen.clone(),
            metrics_path: self.metrics_path.clone(),
            ..DriverConfig::default()
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    info!(
        version = pmem_csi_driver::VERSION,
        mode = %args.mode,
        driver = %args.driver_name,
        "Starting PMEM-CSI driver"
    );

    match run(&args).await {
        Ok(()) => {
            info!("Driver shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(
                error = %e,
                class = ?e.class(),
                retryable = e.is_retryable(),
                "Driver failed"
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<()> {
    let cfg = args.driver_config()?;
    let metrics = DriverMetrics::new(prometheus::default_registry().clone())?;
    let driver = Orchestrator::new(cfg, metrics, KubeBackend, LocalNodeBackend::default())?;
    driver.run(&CancellationToken::new()).await
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
