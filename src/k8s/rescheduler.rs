//! Volume Rescheduler
//!
//! Pending claims of this driver can get pinned to a node through the
//! `volume.kubernetes.io/selected-node` annotation. When that node cannot
//! host the volume, because it is gone or neither carries the node labels
//! nor runs the driver, the annotation is removed so the scheduler picks
//! again.

use crate::config::NodeSelector;
use crate::domain::ports::Rescheduler;
use crate::error::Error;
use crate::k8s::watch::KubeWatchFactory;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::{CSINode, StorageClass};
use kube::api::PostParams;
use kube::runtime::reflector::Store;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

const PROVISIONER_ANNOTATIONS: [&str; 2] = [
    "volume.kubernetes.io/storage-provisioner",
    "volume.beta.kubernetes.io/storage-provisioner",
];

/// How often all pending claims are checked
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Consecutive failed updates after which the loop requests shutdown
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

// =============================================================================
// Decision
// =============================================================================

/// Snapshot of the cached objects one check works on
#[derive(Default)]
pub struct ClusterView {
    pub storage_classes: Vec<Arc<StorageClass>>,
    pub volumes: Vec<Arc<PersistentVolume>>,
    pub csi_nodes: Vec<Arc<CSINode>>,
    pub nodes: Vec<Arc<Node>>,
}

/// Why a selected node cannot host a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsuitable {
    NodeGone,
    NoDriver,
}

impl std::fmt::Display for Unsuitable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unsuitable::NodeGone => write!(f, "node does not exist"),
            Unsuitable::NoDriver => write!(f, "node neither has the labels nor runs the driver"),
        }
    }
}

impl ClusterView {
    /// Returns the selected node and why it has to be released, or `None`
    /// when the claim is fine as it is.
    pub fn check(
        &self,
        pvc: &PersistentVolumeClaim,
        driver_name: &str,
        selector: &NodeSelector,
    ) -> Option<(String, Unsuitable)> {
        if !is_pending(pvc) || self.is_bound(pvc) {
            return None;
        }
        let node_name = pvc.annotations().get(SELECTED_NODE_ANNOTATION)?;
        if !self.is_ours(pvc, driver_name) {
            return None;
        }

        let node = match self.nodes.iter().find(|n| n.name_any() == *node_name) {
            Some(node) => node,
            None => return Some((node_name.clone(), Unsuitable::NodeGone)),
        };
        if selector.matches(node.metadata.labels.as_ref()) || self.runs_driver(node_name, driver_name) {
            return None;
        }
        Some((node_name.clone(), Unsuitable::NoDriver))
    }

    fn is_bound(&self, pvc: &PersistentVolumeClaim) -> bool {
        let volume_name = pvc.spec.as_ref().and_then(|s| s.volume_name.as_deref());
        if volume_name.map_or(false, |name| !name.is_empty()) {
            return true;
        }
        let uid = match pvc.uid() {
            Some(uid) => uid,
            None => return false,
        };
        self.volumes.iter().any(|pv| {
            pv.spec
                .as_ref()
                .and_then(|s| s.claim_ref.as_ref())
                .and_then(|r| r.uid.as_deref())
                == Some(uid.as_str())
        })
    }

    fn is_ours(&self, pvc: &PersistentVolumeClaim, driver_name: &str) -> bool {
        let annotations = pvc.annotations();
        if PROVISIONER_ANNOTATIONS
            .iter()
            .any(|key| annotations.get(*key).map(String::as_str) == Some(driver_name))
        {
            return true;
        }
        let class = match pvc.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()) {
            Some(class) => class,
            None => return false,
        };
        self.storage_classes
            .iter()
            .any(|sc| sc.name_any() == class && sc.provisioner == driver_name)
    }

    fn runs_driver(&self, node_name: &str, driver_name: &str) -> bool {
        self.csi_nodes
            .iter()
            .filter(|c| c.name_any() == node_name)
            .any(|c| c.spec.drivers.iter().any(|d| d.name == driver_name))
    }
}

fn is_pending(pvc: &PersistentVolumeClaim) -> bool {
    match pvc.status.as_ref().and_then(|s| s.phase.as_deref()) {
        None => true,
        Some(phase) => phase == "Pending",
    }
}

// =============================================================================
// Control Loop
// =============================================================================

/// Releases pending claims pinned to unsuitable nodes
pub struct PvcRescheduler {
    driver_name: String,
    client: Client,
    selector: NodeSelector,
    server_version: String,
    period: Duration,
    claims: Store<PersistentVolumeClaim>,
    storage_classes: Store<StorageClass>,
    volumes: Store<PersistentVolume>,
    csi_nodes: Store<CSINode>,
    nodes: Store<Node>,
}

impl PvcRescheduler {
    /// Registers the node watcher and reuses the claim, class, volume and
    /// CSINode watchers of `factory`.
    pub fn new(
        driver_name: &str,
        client: Client,
        factory: &mut KubeWatchFactory,
        selector: &NodeSelector,
        server_version: &str,
    ) -> Self {
        Self {
            driver_name: driver_name.to_string(),
            client,
            selector: selector.clone(),
            server_version: server_version.to_string(),
            period: DEFAULT_CHECK_PERIOD,
            claims: factory.claims(),
            storage_classes: factory.storage_classes(),
            volumes: factory.volumes(),
            csi_nodes: factory.csi_nodes(),
            nodes: factory.nodes(),
        }
    }

    fn view(&self) -> ClusterView {
        ClusterView {
            storage_classes: self.storage_classes.state(),
            volumes: self.volumes.state(),
            csi_nodes: self.csi_nodes.state(),
            nodes: self.nodes.state(),
        }
    }

    async fn run(self, token: CancellationToken) {
        info!(
            server_version = %self.server_version,
            selector = %self.selector,
            period = ?self.period,
            "Rescheduler started"
        );

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let (released, failed) = self.check_all().await;
            if released > 0 {
                info!(released, "Released pending volumes");
            }
            failures = if failed > 0 { failures + failed } else { 0 };
            if failures >= MAX_CONSECUTIVE_FAILURES {
                warn!(failures, "Too many failed updates, requesting shutdown");
                token.cancel();
                break;
            }
        }
        debug!("Rescheduler stopped");
    }

    async fn check_all(&self) -> (u32, u32) {
        let view = self.view();
        let mut released = 0;
        let mut failed = 0;
        for pvc in self.claims.state() {
            let Some((node, reason)) = view.check(&pvc, &self.driver_name, &self.selector) else {
                continue;
            };
            match self.release(&pvc).await {
                Ok(true) => {
                    info!(
                        claim = %pvc.name_any(),
                        namespace = %pvc.namespace().unwrap_or_default(),
                        node = %node,
                        reason = %reason,
                        "Removed selected node"
                    );
                    released += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(claim = %pvc.name_any(), node = %node, error = %e, "Failed to release volume");
                    failed += 1;
                }
            }
        }
        (released, failed)
    }

    /// Remove the annotation. The cached resourceVersion is sent along, so a
    /// conflict means someone else already changed the claim.
    async fn release(&self, pvc: &PersistentVolumeClaim) -> Result<bool, Error> {
        let namespace = pvc.namespace().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);

        let mut updated = pvc.clone();
        updated.annotations_mut().remove(SELECTED_NODE_ANNOTATION);

        match api.replace(&pvc.name_any(), &PostParams::default(), &updated).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = Error::from(e);
                if e.is_conflict() {
                    debug!(claim = %pvc.name_any(), "Claim changed concurrently, already handled");
                    Ok(false)
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl Rescheduler for PvcRescheduler {
    fn start(self, token: CancellationToken) {
        tokio::spawn(self.run(token).instrument(info_span!("rescheduler")));
    }
}
