//! Shared Watch Set
//!
//! One reflector per object kind, all driven from a single factory. Kinds
//! are registered on [`KubeWatchFactory`]; [`start`](WatchFactory::start)
//! consumes the factory, so a registration after start cannot be expressed.

use crate::domain::ports::{ResourceKind, SyncedWatchSet, WatchFactory};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::{CSINode, StorageClass};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ReadyCheck = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

struct Registration {
    kind: ResourceKind,
    driver: BoxFuture<'static, ()>,
    ready: ReadyCheck,
}

// =============================================================================
// Watch Factory
// =============================================================================

/// Collects watchers until started
pub struct KubeWatchFactory {
    client: Client,
    registrations: Vec<Registration>,
    claims: Option<Store<PersistentVolumeClaim>>,
    storage_classes: Option<Store<StorageClass>>,
    volumes: Option<Store<PersistentVolume>>,
    csi_nodes: Option<Store<CSINode>>,
    nodes: Option<Store<Node>>,
}

impl KubeWatchFactory {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            registrations: Vec::new(),
            claims: None,
            storage_classes: None,
            volumes: None,
            csi_nodes: None,
            nodes: None,
        }
    }

    pub fn claims(&mut self) -> Store<PersistentVolumeClaim> {
        self.cached(ResourceKind::Claims, |f| &mut f.claims)
    }

    pub fn storage_classes(&mut self) -> Store<StorageClass> {
        self.cached(ResourceKind::StorageClasses, |f| &mut f.storage_classes)
    }

    pub fn volumes(&mut self) -> Store<PersistentVolume> {
        self.cached(ResourceKind::Volumes, |f| &mut f.volumes)
    }

    pub fn csi_nodes(&mut self) -> Store<CSINode> {
        self.cached(ResourceKind::CsiNodes, |f| &mut f.csi_nodes)
    }

    pub fn nodes(&mut self) -> Store<Node> {
        self.cached(ResourceKind::Nodes, |f| &mut f.nodes)
    }

    fn cached<K>(
        &mut self,
        kind: ResourceKind,
        slot: fn(&mut Self) -> &mut Option<Store<K>>,
    ) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        if let Some(store) = slot(self).as_ref() {
            return store.clone();
        }
        let store = self.watch::<K>(kind);
        *slot(self) = Some(store.clone());
        store
    }

    fn watch<K>(&mut self, kind: ResourceKind) -> Store<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let (store, writer) = reflector::store();
        let api: Api<K> = Api::all(self.client.clone());

        let driver = reflector::reflector(writer, watcher(api, watcher::Config::default()))
            .default_backoff()
            .for_each(move |event| {
                if let Err(e) = event {
                    warn!(kind = %kind, error = %e, "Watch failed");
                }
                futures::future::ready(())
            })
            .boxed();

        let ready_store = store.clone();
        let ready: ReadyCheck = Box::new(move || {
            let store = ready_store.clone();
            async move { store.wait_until_ready().await.is_ok() }.boxed()
        });

        debug!(kind = %kind, "Registered watcher");
        self.registrations.push(Registration {
            kind,
            driver,
            ready,
        });
        store
    }
}

impl WatchFactory for KubeWatchFactory {
    type Started = KubeWatchSet;

    fn register(&mut self, kind: ResourceKind) {
        match kind {
            ResourceKind::Claims => {
                self.claims();
            }
            ResourceKind::StorageClasses => {
                self.storage_classes();
            }
            ResourceKind::Volumes => {
                self.volumes();
            }
            ResourceKind::CsiNodes => {
                self.csi_nodes();
            }
            ResourceKind::Nodes => {
                self.nodes();
            }
        }
    }

    fn start(self, token: CancellationToken) -> KubeWatchSet {
        let mut ready = Vec::with_capacity(self.registrations.len());
        for registration in self.registrations {
            let token = token.clone();
            let kind = registration.kind;
            let driver = registration.driver;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => debug!(kind = %kind, "Watcher stopped"),
                    _ = driver => {
                        // The watch retries with backoff, so ending means it cannot recover.
                        warn!(kind = %kind, "Watcher ended, shutting down");
                        token.cancel();
                    }
                }
            });
            ready.push((kind, registration.ready));
        }
        KubeWatchSet { ready }
    }
}

// =============================================================================
// Started Watch Set
// =============================================================================

/// Running watchers
pub struct KubeWatchSet {
    ready: Vec<(ResourceKind, ReadyCheck)>,
}

#[async_trait]
impl SyncedWatchSet for KubeWatchSet {
    async fn wait_for_sync(&self, token: &CancellationToken) -> BTreeMap<ResourceKind, bool> {
        let checks = self.ready.iter().map(|(kind, ready)| {
            let ready = ready();
            async move {
                let synced = tokio::select! {
                    synced = ready => synced,
                    _ = token.cancelled() => false,
                };
                (*kind, synced)
            }
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }
}
