//! Kubernetes Cluster Backend
//!
//! Connects to the API server with client-side rate limiting and wires the
//! watch set, rescheduler and namespace conversion to that client.

use crate::config::NodeSelector;
use crate::domain::ports::ClusterBackend;
use crate::error::Result;
use crate::k8s::convert;
use crate::k8s::rescheduler::PvcRescheduler;
use crate::k8s::watch::KubeWatchFactory;
use async_trait::async_trait;
use kube::client::ClientBuilder;
use kube::{Client, Config};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::RateLimitLayer;
use tracing::debug;

/// Create a client from the in-cluster or kubeconfig configuration.
///
/// At most `burst` requests are sent per `burst / qps` seconds, which
/// averages to `qps` while allowing bursts.
pub async fn new_client(qps: f64, burst: u32) -> Result<Client> {
    let config = Config::infer().await.map_err(kube::Error::InferConfig)?;
    let (num, per) = rate_limit(qps, burst);
    debug!(cluster_url = %config.cluster_url, num, ?per, "Connecting to apiserver");

    let client = ClientBuilder::try_from(config)?
        .with_layer(&RateLimitLayer::new(num, per))
        .build();
    Ok(client)
}

/// Shortest window handed to the rate limiter, which rejects a zero window
const MIN_RATE_WINDOW: Duration = Duration::from_micros(1);
const MAX_RATE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

fn rate_limit(qps: f64, burst: u32) -> (u64, Duration) {
    let burst = burst.max(1);
    let qps = if qps > 0.0 && qps.is_finite() { qps } else { 1.0 };
    let per = Duration::try_from_secs_f64(f64::from(burst) / qps)
        .unwrap_or(MAX_RATE_WINDOW)
        .clamp(MIN_RATE_WINDOW, MAX_RATE_WINDOW);
    (u64::from(burst), per)
}

/// Cluster collaborators backed by the Kubernetes API
#[derive(Debug, Clone, Default)]
pub struct KubeBackend;

#[async_trait]
impl ClusterBackend for KubeBackend {
    type Client = Client;
    type Factory = KubeWatchFactory;
    type Rescheduler = PvcRescheduler;

    async fn connect(&self, qps: f64, burst: u32) -> Result<Client> {
        new_client(qps, burst).await
    }

    async fn server_version(&self, client: &Client) -> Result<String> {
        Ok(client.apiserver_version().await?.git_version)
    }

    fn new_watch_factory(&self, client: &Client) -> KubeWatchFactory {
        KubeWatchFactory::new(client.clone())
    }

    fn new_rescheduler(
        &self,
        driver_name: &str,
        client: &Client,
        factory: &mut KubeWatchFactory,
        selector: &NodeSelector,
        server_version: &str,
    ) -> PvcRescheduler {
        PvcRescheduler::new(driver_name, client.clone(), factory, selector, server_version)
    }

    async fn force_convert_raw_namespaces(
        &self,
        token: &CancellationToken,
        client: &Client,
        driver_name: &str,
        selector: Option<&NodeSelector>,
        node_id: &str,
    ) -> Result<()> {
        convert::force_convert_raw_namespaces(token, client, driver_name, selector, node_id).await
    }
}
