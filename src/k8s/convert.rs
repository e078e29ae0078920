//! Raw Namespace Conversion
//!
//! Nodes with raw namespaces are labelled `<driver>/convert-raw-namespaces`.
//! Once converted, the node gets the node selector labels so the node driver
//! is scheduled there, and the conversion label is removed so conversion
//! does not run again.

use crate::config::NodeSelector;
use crate::error::{Error, Result, ResultExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Label requesting conversion on a node
pub fn conversion_label(driver_name: &str) -> String {
    format!("{}/convert-raw-namespaces", driver_name)
}

/// Merge patch adding the selector labels and removing the conversion label
pub fn relabel_patch(driver_name: &str, selector: Option<&NodeSelector>) -> Value {
    let mut labels = Map::new();
    if let Some(selector) = selector {
        for (key, value) in selector.labels() {
            labels.insert(key.clone(), Value::String(value.clone()));
        }
    }
    labels.insert(conversion_label(driver_name), Value::Null);
    json!({ "metadata": { "labels": labels } })
}

/// Relabel `node_id` as converted
pub async fn force_convert_raw_namespaces(
    token: &CancellationToken,
    client: &Client,
    driver_name: &str,
    selector: Option<&NodeSelector>,
    node_id: &str,
) -> Result<()> {
    if node_id.is_empty() {
        return Err(Error::Configuration("node ID configuration option missing".into()));
    }
    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let patch = relabel_patch(driver_name, selector);
    let api: Api<Node> = Api::all(client.clone());
    let params = PatchParams::default();
    let merge = Patch::Merge(&patch);
    let update = api.patch(node_id, &params, &merge);

    tokio::select! {
        _ = token.cancelled() => return Err(Error::Cancelled),
        result = update => {
            result.context(format!("relabel node {}", node_id))?;
        }
    }

    info!(
        node = node_id,
        selector = %selector.map(ToString::to_string).unwrap_or_default(),
        "Node relabelled after raw namespace conversion"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server};
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Seen = Arc<Mutex<Vec<(String, String, Value)>>>;

    /// API server answering every request with node `worker-1`
    async fn apiserver() -> (Client, Seen) {
        let seen: Seen = Arc::default();
        let log = seen.clone();
        let make_svc = make_service_fn(move |_| {
            let log = log.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let log = log.clone();
                    async move {
                        let method = req.method().to_string();
                        let path = req.uri().path().to_string();
                        let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                        log.lock().await.push((method, path, body));
                        let node = json!({
                            "apiVersion": "v1",
                            "kind": "Node",
                            "metadata": { "name": "worker-1" },
                        });
                        Ok::<_, Infallible>(Response::new(Body::from(node.to_string())))
                    }
                }))
            }
        });

        let server = Server::bind(&([127, 0, 0, 1], 0).into()).serve(make_svc);
        let url = format!("http://{}", server.local_addr());
        tokio::spawn(server);

        let config = kube::Config::new(url.parse().unwrap());
        (Client::try_from(config).unwrap(), seen)
    }

    #[test]
    fn test_relabel_patch() {
        let selector = NodeSelector::from_json(r#"{"storage":"pmem"}"#).unwrap();
        let patch = relabel_patch("pmem-csi.intel.com", Some(&selector));
        assert_eq!(
            patch,
            json!({ "metadata": { "labels": {
                "storage": "pmem",
                "pmem-csi.intel.com/convert-raw-namespaces": null,
            }}})
        );
    }

    #[test]
    fn test_relabel_patch_without_selector() {
        let patch = relabel_patch("example.com", None);
        assert_eq!(
            patch["metadata"]["labels"],
            json!({ "example.com/convert-raw-namespaces": null })
        );
    }

    #[tokio::test]
    async fn test_relabels_node() {
        let (client, seen) = apiserver().await;
        let selector = NodeSelector::from_json(r#"{"storage":"pmem"}"#).unwrap();

        force_convert_raw_namespaces(
            &CancellationToken::new(),
            &client,
            "pmem-csi.intel.com",
            Some(&selector),
            "worker-1",
        )
        .await
        .unwrap();

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        let (method, path, body) = &seen[0];
        assert_eq!(method, "PATCH");
        assert_eq!(path, "/api/v1/nodes/worker-1");
        assert_eq!(body, &relabel_patch("pmem-csi.intel.com", Some(&selector)));
    }

    #[tokio::test]
    async fn test_missing_node_id_and_cancelled_token() {
        let (client, seen) = apiserver().await;

        let err = force_convert_raw_namespaces(&CancellationToken::new(), &client, "d", None, "")
            .await
            .unwrap_err();
        assert_matches!(err, Error::Configuration(_));

        let token = CancellationToken::new();
        token.cancel();
        let err = force_convert_raw_namespaces(&token, &client, "d", None, "worker-1")
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled);
        assert!(seen.lock().await.is_empty());
    }
}
