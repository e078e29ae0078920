//! CSI Node Service
//!
//! Reports this node's identity and topology. Publishing and staging are
//! handled by the device layer and are not served here.

use crate::domain::ports::{ProtocolService, Status};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct NodeServer {
    node_id: String,
    /// Topology segment key, `<driver name>/node`
    topology_key: String,
}

impl NodeServer {
    pub fn new(node_id: &str, topology_key: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            topology_key: topology_key.to_string(),
        }
    }
}

#[async_trait]
impl ProtocolService for NodeServer {
    fn name(&self) -> &'static str {
        "csi.v1.Node"
    }

    async fn call(&self, method: &str, _request: Value) -> Result<Value, Status> {
        match method {
            "NodeGetInfo" => {
                let mut segments = serde_json::Map::new();
                segments.insert(self.topology_key.clone(), Value::from(self.node_id.clone()));
                Ok(json!({
                    "node_id": self.node_id,
                    "max_volumes_per_node": 0,
                    "accessible_topology": { "segments": segments },
                }))
            }
            "NodeGetCapabilities" => Ok(json!({
                "capabilities": [
                    { "rpc": { "type": "STAGE_UNSTAGE_VOLUME" } },
                ]
            })),
            other => Err(Status::unimplemented(self.name(), other)),
        }
    }
}
