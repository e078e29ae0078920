//! CSI Identity Service

use crate::domain::ports::{ProtocolService, Status};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Answers plugin info, capability and readiness probes
pub struct IdentityServer {
    driver_name: String,
    version: String,
}

impl IdentityServer {
    pub fn new(driver_name: &str, version: &str) -> Self {
        Self {
            driver_name: driver_name.to_string(),
            version: version.to_string(),
        }
    }
}

#[async_trait]
impl ProtocolService for IdentityServer {
    fn name(&self) -> &'static str {
        "csi.v1.Identity"
    }

    async fn call(&self, method: &str, _request: Value) -> Result<Value, Status> {
        match method {
            "GetPluginInfo" => Ok(json!({
                "name": self.driver_name,
                "vendor_version": self.version,
            })),
            "GetPluginCapabilities" => Ok(json!({
                "capabilities": [
                    { "service": { "type": "CONTROLLER_SERVICE" } },
                    { "service": { "type": "VOLUME_ACCESSIBILITY_CONSTRAINTS" } },
                ]
            })),
            "Probe" => Ok(json!({ "ready": true })),
            other => Err(Status::unimplemented(self.name(), other)),
        }
    }
}
