//! Serves the calls snaps make back out to the host.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use snaps_capabilities::builtin::methods::DIALOG;
use snaps_capabilities::{CapabilityRegistry, PermissionStore};
use snaps_core::{JsonRpcError, SnapId};
use snaps_execution::{RequestTimers, RpcHandler};
use tracing::debug;

/// Routes outbound snap calls through the capability registry.
///
/// Dialogs wait on a person, so the calling snap's request deadlines are
/// suspended for their duration.
pub(crate) struct CapabilityRpc {
    registry: Arc<CapabilityRegistry>,
    permissions: Arc<dyn PermissionStore>,
}

impl CapabilityRpc {
    pub(crate) fn new(
        registry: Arc<CapabilityRegistry>,
        permissions: Arc<dyn PermissionStore>,
    ) -> Self {
        Self {
            registry,
            permissions,
        }
    }
}

#[async_trait]
impl RpcHandler for CapabilityRpc {
    async fn handle(
        &self,
        snap_id: &SnapId,
        method: &str,
        params: Value,
        timers: &RequestTimers,
    ) -> Result<Value, JsonRpcError> {
        let interactive = method == DIALOG;
        if interactive {
            timers.suspend();
        }
        let outcome = self
            .registry
            .execute_restricted_method(self.permissions.as_ref(), snap_id, method, params)
            .await;
        if interactive {
            timers.resume();
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(snap_id = %snap_id, method, error = %e, "Restricted method rejected");
                Err(e.to_json_rpc())
            },
        }
    }
}
