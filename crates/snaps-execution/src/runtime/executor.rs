//! The seam between the runtime loop and whatever actually runs snap code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use snaps_core::{HandlerType, JsonRpcError, JsonRpcRequest, SnapId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::{CommandResponse, Frame, Notification, NotificationMethod, RpcRequest};

/// Runs snap code inside one runtime.
///
/// One executor instance serves one runtime; it never sees another runtime's
/// snaps.
#[async_trait]
pub trait SnapExecutor: Send + Sync {
    /// Load `source` for `snap_id`, exposing exactly `endowments`.
    ///
    /// `host` is the snap's only path back to the host; keep it for later
    /// calls.
    async fn execute(
        &self,
        snap_id: &SnapId,
        source: Vec<u8>,
        endowments: Vec<String>,
        host: HostRpc,
    ) -> Result<(), JsonRpcError>;

    /// Run `handler` of a loaded snap.
    ///
    /// Errors are the snap's own and travel back to the caller unchanged.
    async fn invoke(
        &self,
        snap_id: &SnapId,
        handler: HandlerType,
        origin: String,
        request: JsonRpcRequest,
    ) -> Result<Value, JsonRpcError>;

    /// Release everything before the runtime exits.
    async fn terminate(&self) {}
}

/// Produces a fresh executor for each new runtime.
pub trait ExecutorFactory: Send + Sync {
    /// A new, empty executor.
    fn create(&self) -> Arc<dyn SnapExecutor>;
}

impl<F, E> ExecutorFactory for F
where
    F: Fn() -> E + Send + Sync,
    E: SnapExecutor + 'static,
{
    fn create(&self) -> Arc<dyn SnapExecutor> {
        Arc::new(self())
    }
}

type RpcReply = oneshot::Sender<Result<Value, JsonRpcError>>;

/// Runtime-wide state of the RPC sub-channel.
pub(crate) struct RpcChannel {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, RpcReply>>,
    next_id: AtomicU64,
}

impl RpcChannel {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<Frame>) -> Arc<Self> {
        Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Route a host reply to its waiting caller.
    pub(crate) fn resolve(&self, response: CommandResponse) {
        let id = response.id;
        let Some(reply) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        else {
            warn!(id, "Dropping RPC response with unknown id");
            return;
        };
        let outcome = match response.into_result() {
            Ok(outcome) => outcome,
            Err(e) => Err(JsonRpcError::new(e.to_string()).with_code(JsonRpcError::INTERNAL)),
        };
        let _ = reply.send(outcome);
    }

    /// Fail every outstanding call; the host is gone.
    pub(crate) fn close(&self) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, reply) in drained {
            let _ = reply.send(Err(host_disconnected()));
        }
    }

    pub(crate) fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

fn host_disconnected() -> JsonRpcError {
    JsonRpcError::new("host disconnected").with_code(JsonRpcError::INTERNAL)
}

/// A snap's handle for calling back into the host.
#[derive(Clone)]
pub struct HostRpc {
    snap_id: SnapId,
    channel: Arc<RpcChannel>,
}

impl std::fmt::Debug for HostRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRpc")
            .field("snap_id", &self.snap_id)
            .finish_non_exhaustive()
    }
}

impl HostRpc {
    pub(crate) fn new(snap_id: SnapId, channel: Arc<RpcChannel>) -> Self {
        Self { snap_id, channel }
    }

    /// The snap this handle speaks for.
    #[must_use]
    pub fn snap_id(&self) -> &SnapId {
        &self.snap_id
    }

    /// Call `method` on the host and wait for the answer.
    ///
    /// # Errors
    ///
    /// Returns the host's error, or an internal error if the host is gone.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        let id = self.channel.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.channel
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        let request = RpcRequest {
            id,
            snap_id: self.snap_id.clone(),
            method: method.to_string(),
            params,
        };
        let frame = Frame::rpc(&request)
            .map_err(|e| JsonRpcError::new(e.to_string()).with_code(JsonRpcError::INTERNAL))?;
        debug!(snap_id = %self.snap_id, id, method, "Outbound RPC");
        if !self.channel.send(frame) {
            self.channel
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(host_disconnected());
        }
        rx.await.unwrap_or_else(|_| Err(host_disconnected()))
    }

    /// Send a notification about this snap.
    pub fn notify(&self, method: NotificationMethod, mut params: Value) {
        if let Value::Object(map) = &mut params {
            map.insert("snapId".into(), json!(self.snap_id));
        } else {
            params = json!({ "snapId": self.snap_id, "data": params });
        }
        match Frame::command(&Notification { method, params }) {
            Ok(frame) => {
                if !self.channel.send(frame) {
                    debug!(snap_id = %self.snap_id, ?method, "Notification after host disconnect");
                }
            },
            Err(e) => warn!(error = %e, "Failed to encode notification"),
        }
    }

    /// Report an error raised outside any request.
    pub fn unhandled_error(&self, error: &JsonRpcError) {
        self.notify(NotificationMethod::UnhandledError, json!({ "error": error }));
    }
}
