//! CSI Controller Service, node-local variant
//!
//! Capacity and volume listing for the PMEM managed on this node.

use crate::domain::ports::{DeviceManagerRef, ProtocolService, StateStoreRef, Status};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct NodeControllerServer {
    node_id: String,
    dm: DeviceManagerRef,
    sm: StateStoreRef,
}

impl NodeControllerServer {
    pub fn new(node_id: &str, dm: DeviceManagerRef, sm: StateStoreRef) -> Self {
        Self {
            node_id: node_id.to_string(),
            dm,
            sm,
        }
    }
}

#[async_trait]
impl ProtocolService for NodeControllerServer {
    fn name(&self) -> &'static str {
        "csi.v1.Controller"
    }

    async fn call(&self, method: &str, _request: Value) -> Result<Value, Status> {
        match method {
            "GetCapacity" => {
                let capacity = self.dm.get_capacity().await.map_err(Status::internal)?;
                Ok(json!({
                    "available_capacity": capacity.available,
                    "maximum_volume_size": capacity.max_volume_size,
                }))
            }
            "ListVolumes" => {
                let ids = self.sm.list_ids().await.map_err(Status::internal)?;
                let entries: Vec<Value> = ids
                    .into_iter()
                    .map(|id| {
                        json!({
                            "volume": { "volume_id": id },
                            "status": { "published_node_ids": [self.node_id] },
                        })
                    })
                    .collect();
                Ok(json!({ "entries": entries }))
            }
            "ControllerGetCapabilities" => Ok(json!({
                "capabilities": [
                    { "rpc": { "type": "LIST_VOLUMES" } },
                    { "rpc": { "type": "GET_CAPACITY" } },
                ]
            })),
            other => Err(Status::unimplemented(self.name(), other)),
        }
    }
}
