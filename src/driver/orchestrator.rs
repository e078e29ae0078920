//! Driver Orchestrator
//!
//! Decides from the validated configuration which sub-services an instance
//! runs, starts them in dependency order, links their failures to one shared
//! cancellation token and tears everything down when the process terminates.

use crate::config::{Config, DriverConfig, DriverMode};
use crate::csi::{IdentityServer, NodeControllerServer, NodeServer};
use crate::domain::ports::{
    ClusterBackend, NodeBackend, ProtocolService, Rescheduler, ResourceKind, ServiceLifecycle,
    SyncedWatchSet, WatchFactory,
};
use crate::driver::https::start_https_server;
use crate::driver::metrics::{DriverMetrics, MetricsHandler, ProtocolMetrics};
use crate::driver::shutdown::{self, wait_for_termination, ForceStopGuard};
use crate::error::{Error, Result, ResultExt};
use futures::Future;
use prometheus::core::Collector;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Kinds every controller instance watches
const CONTROLLER_KINDS: [ResourceKind; 4] = [
    ResourceKind::Claims,
    ResourceKind::StorageClasses,
    ResourceKind::Volumes,
    ResourceKind::CsiNodes,
];

// =============================================================================
// Orchestrator
// =============================================================================

/// Top-level driver: owns the configuration and supervises all sub-services
pub struct Orchestrator<C: ClusterBackend, N: NodeBackend> {
    cfg: Config,
    metrics: DriverMetrics,
    /// Registries served on the metrics endpoint
    gatherers: Vec<Registry>,
    cluster: C,
    node: N,
}

impl<C: ClusterBackend, N: NodeBackend> Orchestrator<C, N> {
    /// Validate `cfg` and create the driver. Fails before touching anything
    /// else if the configuration is invalid.
    pub fn new(cfg: DriverConfig, metrics: DriverMetrics, cluster: C, node: N) -> Result<Self> {
        let cfg = cfg.validate()?;

        // Should this get called more than once per process, all of them
        // will record their version.
        metrics.record_version(cfg.version());

        // The process-wide registry carries everything registered globally,
        // not just our own metrics.
        let gatherers = vec![metrics.registry().clone()];

        Ok(Self {
            cfg,
            metrics,
            gatherers,
            cluster,
            node,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Key used for topology constraints, `<driver name>/node`
    pub fn topology_key(&self) -> &str {
        self.cfg.topology_key()
    }

    /// Run until SIGINT/SIGTERM or until a sub-service fails.
    ///
    /// Returns `Ok(())` on a clean shutdown and the startup error otherwise.
    pub async fn run(self, parent: &CancellationToken) -> Result<()> {
        self.run_until(parent, shutdown::termination_signal()).await
    }

    /// Like [`run`](Self::run), with the termination signal supplied by the caller
    pub async fn run_until<S>(mut self, parent: &CancellationToken, signal: S) -> Result<()>
    where
        S: Future<Output = &'static str> + Send,
    {
        let server = self.node.new_server();
        // Ensure that the server is stopped before we return.
        let guard = ForceStopGuard::new(&server);
        let token = parent.child_token();

        let result = self.serve(&server, &token, signal).await;

        token.cancel();
        guard.finish().await;
        result
    }

    async fn serve<S>(
        &mut self,
        server: &N::Server,
        token: &CancellationToken,
        signal: S,
    ) -> Result<()>
    where
        S: Future<Output = &'static str> + Send,
    {
        let mode = self
            .cfg
            .mode()
            .ok_or_else(|| Error::UnsupportedMode(self.cfg.mode_name().to_string()))?;

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        info!(
            mode = %mode,
            driver = self.cfg.driver_name(),
            version = self.cfg.version(),
            "Starting driver"
        );

        match mode {
            DriverMode::Controller => self.start_controller(token).await?,
            DriverMode::Node => self.start_node(server, token).await?,
            DriverMode::ForceConvertRawNamespaces => {
                self.force_convert(token).await?;

                // By proceeding to waiting for the termination signal below
                // we keep the pod around after its work is done until
                // Kubernetes notices that it is no longer needed. Exiting,
                // even with a zero exit code, would race the label change
                // against a container restart.
                info!("Raw namespace conversion is done, waiting for termination signal.");
            }
        }

        if let Some(listen) = self.cfg.metrics_listen() {
            let addr = self.start_metrics(token, listen).await?;
            info!(
                endpoint = %format!("http://{}{}", addr, self.cfg.metrics_path()),
                "Prometheus endpoint started."
            );
        }

        match wait_for_termination(token, signal, self.cfg.termination_grace()).await {
            shutdown::Termination::Signal(_) => {}
            shutdown::Termination::Cancelled => {
                // Some sub-service failed. Quit directly.
                warn!("Shutting down after sub-service failure");
            }
        }

        // In contrast to the force stop on the way out, here the server may
        // finish its work on any pending call.
        server.stop();
        server.wait().await;

        Ok(())
    }

    // =========================================================================
    // Mode Startup
    // =========================================================================

    async fn start_controller(&self, token: &CancellationToken) -> Result<()> {
        let client = self
            .cluster
            .connect(self.cfg.kube_api_qps(), self.cfg.kube_api_burst())
            .await
            .context("connect to apiserver")?;

        // One factory for all namespaces.
        let mut factory = self.cluster.new_watch_factory(&client);
        for kind in CONTROLLER_KINDS {
            factory.register(kind);
        }

        let mut rescheduler = None;
        if let Some(selector) = self.cfg.node_selector() {
            let server_version = self
                .cluster
                .server_version(&client)
                .await
                .context("discover server version")?;

            // The rescheduler must be created before the factory starts
            // because it may register more watchers.
            //
            // There is no leader election. The watchers run on hot spares
            // anyway, and running the check redundantly is harmless: when
            // several instances unset the same annotation, one update wins
            // and the others get a conflict and find nothing left to do.
            rescheduler = Some(self.cluster.new_rescheduler(
                self.cfg.driver_name(),
                &client,
                &mut factory,
                selector,
                &server_version,
            ));
        }

        // All watchers are registered, now the factory can run.
        let watch_set = factory.start(token.clone());
        let synced = watch_set.wait_for_sync(token).await;
        debug!(cache_sync_result = ?synced, "Synchronized caches");
        if let Some((kind, _)) = synced.iter().find(|(_, ok)| !**ok) {
            return Err(Error::CacheSync { kind: *kind });
        }

        if let Some(rescheduler) = rescheduler {
            rescheduler.start(token.clone());
        }

        Ok(())
    }

    async fn start_node(&mut self, server: &N::Server, token: &CancellationToken) -> Result<()> {
        let dm = self
            .node
            .device_manager(
                token,
                self.cfg.device_manager(),
                self.cfg.pmem_percentage(),
            )
            .await
            .context("create device manager")?;
        let sm = self
            .node
            .state_store(self.cfg.state_base_path())
            .await
            .context("create state store")?;

        // On the CSI endpoint we gather statistics for incoming method calls
        // like any other CSI driver.
        let cmm = ProtocolMetrics::new(self.cfg.driver_name())?;
        self.gatherers.push(cmm.registry().clone());

        let ids = Arc::new(IdentityServer::new(
            self.cfg.driver_name(),
            self.cfg.version(),
        ));
        let cs = Arc::new(NodeControllerServer::new(
            self.cfg.node_id(),
            dm.clone(),
            sm,
        ));
        let ns = Arc::new(NodeServer::new(self.cfg.node_id(), self.cfg.topology_key()));

        let services: Vec<Arc<dyn ProtocolService>> = vec![ids, ns, cs];
        server
            .start(
                token,
                self.cfg.endpoint(),
                self.cfg.node_id(),
                cmm,
                services,
            )
            .await
            .context("start CSI server")?;

        // Also collect metrics data via the device manager.
        register_collector(self.metrics.registry(), || {
            dm.capacity_collector(self.cfg.node_id(), self.cfg.driver_name())
        })?;

        let capacity = dm.get_capacity().await.context("get initial capacity")?;
        info!(
            available = capacity.available,
            managed = capacity.managed,
            max_volume_size = capacity.max_volume_size,
            total = capacity.total,
            "PMEM-CSI ready."
        );

        Ok(())
    }

    async fn force_convert(&self, token: &CancellationToken) -> Result<()> {
        let client = self
            .cluster
            .connect(self.cfg.kube_api_qps(), self.cfg.kube_api_burst())
            .await
            .context("connect to apiserver")?;

        self.cluster
            .force_convert_raw_namespaces(
                token,
                &client,
                self.cfg.driver_name(),
                self.cfg.node_selector(),
                self.cfg.node_id(),
            )
            .await
    }

    /// Start the Prometheus endpoint. Failures after startup cancel `token`.
    async fn start_metrics(&self, token: &CancellationToken, listen: &str) -> Result<SocketAddr> {
        let handler = MetricsHandler::new(
            self.cfg.metrics_path(),
            self.gatherers.clone(),
            self.metrics.clone(),
        );
        start_https_server(token, listen, move |req| handler.handle(req.uri().path())).await
    }
}

/// Register the collector built by `make`. One left behind by an earlier
/// driver instance in the same process is replaced, so the registry always
/// reports the current device manager.
fn register_collector<F>(registry: &Registry, make: F) -> Result<()>
where
    F: Fn() -> Box<dyn Collector>,
{
    match registry.register(make()) {
        Err(prometheus::Error::AlreadyReg) => {
            debug!("Replacing capacity collector of an earlier instance");
            registry.unregister(make())?;
            registry.register(make())?;
            Ok(())
        }
        result => Ok(result?),
    }
}
