//! Host-side handling of calls snap code makes back out to the host.

use async_trait::async_trait;
use serde_json::Value;
use snaps_core::{JsonRpcError, SnapId};

use crate::service::RequestTimers;

/// Serves the RPC sub-channel.
///
/// `timers` controls the deadlines of the calling snap's in-flight requests.
/// Suspend them around anything that waits on a person, such as an approval
/// dialog, so that time is not charged to the snap.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Answer `method` for `snap_id`.
    async fn handle(
        &self,
        snap_id: &SnapId,
        method: &str,
        params: Value,
        timers: &RequestTimers,
    ) -> Result<Value, JsonRpcError>;
}

/// Rejects every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAllRpc;

#[async_trait]
impl RpcHandler for RejectAllRpc {
    async fn handle(
        &self,
        _snap_id: &SnapId,
        method: &str,
        _params: Value,
        _timers: &RequestTimers,
    ) -> Result<Value, JsonRpcError> {
        Err(JsonRpcError::new(format!("method not found: {method}"))
            .with_code(JsonRpcError::METHOD_NOT_FOUND))
    }
}
