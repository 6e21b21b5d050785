//! The execution service: host-side owner of every isolated runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use snaps_config::ExecutionConfig;
use snaps_core::{HandlerType, JsonRpcError, JsonRpcRequest, SnapId};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::backend::{BoxedReader, IsolationBackend};
use crate::connection::Connection;
use crate::error::{ExecutionError, ExecutionResult};
use crate::events::ExecutionEvent;
use crate::protocol::{
    Command, CommandRequest, CommandResponse, Frame, FrameReader, Notification,
    NotificationMethod, RpcRequest, RuntimeMessage, frame_reader, frame_writer,
    initiate_handshake, next_frame, send_frame,
};
use crate::rpc::{RejectAllRpc, RpcHandler};
use crate::runtime_id::RuntimeId;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    backend: Arc<dyn IsolationBackend>,
    config: ExecutionConfig,
    rpc_handler: Arc<dyn RpcHandler>,
    runtimes: Mutex<HashMap<RuntimeId, Arc<Connection>>>,
    snaps: Mutex<HashMap<SnapId, RuntimeId>>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl Inner {
    fn connection(&self, runtime_id: RuntimeId) -> ExecutionResult<Arc<Connection>> {
        lock(&self.runtimes)
            .get(&runtime_id)
            .cloned()
            .ok_or(ExecutionError::UnknownRuntime(runtime_id))
    }

    fn connection_for(&self, snap_id: &SnapId) -> ExecutionResult<Arc<Connection>> {
        let runtime_id = lock(&self.snaps)
            .get(snap_id)
            .copied()
            .ok_or_else(|| ExecutionError::NotRunning(snap_id.clone()))?;
        self.connection(runtime_id)
    }

    fn emit(&self, event: ExecutionEvent) {
        debug!(kind = event.kind(), "Execution event");
        let _ = self.events.send(event);
    }

    /// Forget a runtime. Returns the connection if it was still registered.
    fn unregister(&self, runtime_id: RuntimeId) -> Option<Arc<Connection>> {
        let connection = lock(&self.runtimes).remove(&runtime_id)?;
        let mut snaps = lock(&self.snaps);
        for snap_id in connection.snaps() {
            if snaps.get(&snap_id) == Some(&runtime_id) {
                snaps.remove(&snap_id);
            }
        }
        Some(connection)
    }

    /// The channel died without the host asking.
    async fn runtime_lost(&self, runtime_id: RuntimeId, reason: String) {
        let Some(connection) = self.unregister(runtime_id) else {
            return;
        };
        warn!(%runtime_id, %reason, "Runtime lost");
        connection.close(&reason);
        self.emit(ExecutionEvent::RuntimeTerminated {
            runtime_id,
            snap_ids: connection.snaps(),
            reason,
            unexpected: true,
        });
        connection.shutdown(Duration::ZERO).await;
    }

    fn on_notification(&self, connection: &Connection, notification: Notification) {
        let snap_id = notification
            .params
            .get("snapId")
            .cloned()
            .and_then(|v| serde_json::from_value::<SnapId>(v).ok());
        let Some(snap_id) = snap_id.filter(|id| connection.hosts(id)) else {
            warn!(
                runtime_id = %connection.id(),
                method = ?notification.method,
                "Dropping notification for a snap this runtime does not host"
            );
            return;
        };
        let event = match notification.method {
            NotificationMethod::UnhandledError => {
                let error = notification
                    .params
                    .get("error")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<JsonRpcError>(v).ok())
                    .unwrap_or_else(|| JsonRpcError::new("unknown error"));
                warn!(snap_id = %snap_id, error = %error, "Unhandled snap error");
                ExecutionEvent::UnhandledError { snap_id, error }
            },
            NotificationMethod::OutboundRequest => ExecutionEvent::OutboundRequest { snap_id },
            NotificationMethod::OutboundResponse => ExecutionEvent::OutboundResponse { snap_id },
        };
        self.emit(event);
    }
}

/// Suspends and resumes the deadlines of one snap's pending requests.
///
/// Handed to [`RpcHandler`]s so a host call that waits on the user does not
/// consume the snap's execution budget.
#[derive(Clone)]
pub struct RequestTimers {
    inner: Weak<Inner>,
    snap_id: SnapId,
}

impl std::fmt::Debug for RequestTimers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTimers")
            .field("snap_id", &self.snap_id)
            .finish_non_exhaustive()
    }
}

impl RequestTimers {
    /// Pause the deadlines.
    pub fn suspend(&self) {
        if let Some(inner) = self.inner.upgrade() {
            ExecutionService { inner }.suspend_timers(&self.snap_id);
        }
    }

    /// Resume the deadlines.
    pub fn resume(&self) {
        if let Some(inner) = self.inner.upgrade() {
            ExecutionService { inner }.resume_timers(&self.snap_id);
        }
    }
}

/// Owns isolated runtimes and talks to them over the command protocol.
///
/// Cheap to clone; clones share the same runtimes.
#[derive(Clone)]
pub struct ExecutionService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ExecutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionService")
            .field("backend", &self.inner.backend.name())
            .field("runtimes", &self.runtime_count())
            .finish_non_exhaustive()
    }
}

impl ExecutionService {
    /// Create a service that rejects every outbound RPC.
    #[must_use]
    pub fn new(backend: Arc<dyn IsolationBackend>, config: ExecutionConfig) -> Self {
        Self::with_rpc_handler(backend, config, Arc::new(RejectAllRpc))
    }

    /// Create a service whose runtimes' outbound calls go to `rpc_handler`.
    #[must_use]
    pub fn with_rpc_handler(
        backend: Arc<dyn IsolationBackend>,
        config: ExecutionConfig,
        rpc_handler: Arc<dyn RpcHandler>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                rpc_handler,
                runtimes: Mutex::new(HashMap::new()),
                snaps: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Timeouts in effect.
    #[must_use]
    pub fn config(&self) -> &ExecutionConfig {
        &self.inner.config
    }

    /// Receive [`ExecutionEvent`]s from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    /// Number of live runtimes.
    #[must_use]
    pub fn runtime_count(&self) -> usize {
        lock(&self.inner.runtimes).len()
    }

    /// The runtime hosting `snap_id`.
    #[must_use]
    pub fn runtime_for(&self, snap_id: &SnapId) -> Option<RuntimeId> {
        lock(&self.inner.snaps).get(snap_id).copied()
    }

    /// Whether `snap_id` is loaded into a runtime.
    #[must_use]
    pub fn is_executing(&self, snap_id: &SnapId) -> bool {
        self.runtime_for(snap_id).is_some()
    }

    /// Snaps loaded into `runtime_id`.
    #[must_use]
    pub fn snaps_in(&self, runtime_id: RuntimeId) -> Vec<SnapId> {
        self.inner
            .connection(runtime_id)
            .map(|c| c.snaps())
            .unwrap_or_default()
    }

    /// Requests in flight on `runtime_id`.
    #[must_use]
    pub fn pending_requests(&self, runtime_id: RuntimeId) -> usize {
        self.inner
            .connection(runtime_id)
            .map_or(0, |c| c.pending_count())
    }

    /// Time since `snap_id`'s runtime last answered anything.
    #[must_use]
    pub fn idle_time(&self, snap_id: &SnapId) -> Option<Duration> {
        self.inner.connection_for(snap_id).ok().map(|c| c.idle_for())
    }

    /// Create a runtime, retrying environment failures up to the configured
    /// count.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::EnvironmentUnavailable`] once retries are
    /// exhausted.
    #[instrument(skip(self), fields(backend = self.inner.backend.name()))]
    pub async fn start(&self) -> ExecutionResult<RuntimeId> {
        let retries = self.inner.config.runtime_start_retries;
        let mut attempt: u32 = 0;
        loop {
            match self.start_once().await {
                Ok(runtime_id) => return Ok(runtime_id),
                Err(ExecutionError::EnvironmentUnavailable(reason)) if attempt < retries => {
                    attempt = attempt.saturating_add(1);
                    warn!(attempt, retries, %reason, "Runtime start failed; retrying");
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn start_once(&self) -> ExecutionResult<RuntimeId> {
        let runtime_id = RuntimeId::new();
        let streams = self.inner.backend.spawn(&runtime_id).await?;
        let mut reader = frame_reader(streams.reader);
        let mut writer = frame_writer(streams.writer);

        let start_timeout = self.inner.config.runtime_start_timeout();
        let handshake = tokio::time::timeout(
            start_timeout,
            initiate_handshake(&mut reader, &mut writer),
        )
        .await;
        match handshake {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                streams.guard.shutdown().await;
                return Err(ExecutionError::EnvironmentUnavailable(format!(
                    "handshake failed: {e}"
                )));
            },
            Err(_) => {
                streams.guard.shutdown().await;
                return Err(ExecutionError::EnvironmentUnavailable(format!(
                    "runtime did not acknowledge within {}ms",
                    start_timeout.as_millis()
                )));
            },
        }

        let (outbound, mut queue) = mpsc::unbounded_channel::<Frame>();
        let connection = Connection::new(runtime_id, outbound, streams.guard);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = send_frame(&mut writer, &frame).await {
                    warn!(%runtime_id, error = %e, "Runtime writer failed");
                    break;
                }
            }
        });
        let reader_task = tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&connection),
            reader,
        ));
        connection.set_tasks(reader_task, writer_task);

        lock(&self.inner.runtimes).insert(runtime_id, connection);
        info!(%runtime_id, "Runtime started");
        Ok(runtime_id)
    }

    /// Load a snap into a runtime with exactly `endowments` as its globals.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::AlreadyExecuting`] if the snap is loaded
    /// anywhere, or the runtime's error if loading fails.
    #[instrument(skip(self, source, endowments), fields(snap_id = %snap_id))]
    pub async fn execute_snap(
        &self,
        runtime_id: RuntimeId,
        snap_id: &SnapId,
        source: &[u8],
        endowments: Vec<String>,
    ) -> ExecutionResult<()> {
        let connection = self.inner.connection(runtime_id)?;
        {
            let mut snaps = lock(&self.inner.snaps);
            if snaps.contains_key(snap_id) {
                return Err(ExecutionError::AlreadyExecuting(snap_id.clone()));
            }
            snaps.insert(snap_id.clone(), runtime_id);
        }
        connection.add_snap(snap_id.clone());

        let params = vec![
            json!(snap_id),
            Value::from(STANDARD.encode(source)),
            json!(endowments),
        ];
        let outcome = connection
            .request(
                Some(snap_id),
                Command::ExecuteSnap,
                params,
                Some(self.inner.config.max_request_time()),
            )
            .await;

        match outcome {
            Ok(_) => {
                info!(%runtime_id, "Snap executing");
                Ok(())
            },
            Err(e) => {
                connection.remove_snap(snap_id);
                let mut snaps = lock(&self.inner.snaps);
                if snaps.get(snap_id) == Some(&runtime_id) {
                    snaps.remove(snap_id);
                }
                warn!(%runtime_id, error = %e, "Snap failed to load");
                Err(e)
            },
        }
    }

    /// Start a dedicated runtime and load `snap_id` into it. The runtime is
    /// torn down again if loading fails.
    ///
    /// # Errors
    ///
    /// Returns the start or load error.
    pub async fn execute_in_new_runtime(
        &self,
        snap_id: &SnapId,
        source: &[u8],
        endowments: Vec<String>,
    ) -> ExecutionResult<RuntimeId> {
        let runtime_id = self.start().await?;
        if let Err(e) = self
            .execute_snap(runtime_id, snap_id, source, endowments)
            .await
        {
            let _ = self.terminate(runtime_id).await;
            return Err(e);
        }
        Ok(runtime_id)
    }

    /// Run `handler` of a loaded snap under the handler's configured budget.
    ///
    /// Resolves with exactly one of: the snap's result, the snap's own error
    /// ([`ExecutionError::Snap`]), a timeout, or termination.
    ///
    /// # Errors
    ///
    /// See above; also [`ExecutionError::NotRunning`].
    #[instrument(skip(self, request), fields(snap_id = %snap_id, handler = %handler))]
    pub async fn invoke(
        &self,
        snap_id: &SnapId,
        handler: HandlerType,
        origin: &str,
        request: JsonRpcRequest,
    ) -> ExecutionResult<Value> {
        let connection = self.inner.connection_for(snap_id)?;
        let budget = self.inner.config.handler_timeout(handler.as_str());
        let params = vec![
            json!(snap_id),
            json!(handler),
            Value::from(origin),
            serde_json::to_value(&request)?,
        ];
        let outcome = connection
            .request(Some(snap_id), Command::SnapRpc, params, Some(budget))
            .await;
        match &outcome {
            Ok(_) => debug!("Handler returned"),
            Err(ExecutionError::Snap(e)) => debug!(error = %e, "Handler raised"),
            Err(e) => warn!(error = %e, "Handler invocation failed"),
        }
        outcome
    }

    /// Liveness check with the short ping budget.
    ///
    /// # Errors
    ///
    /// Returns a timeout or termination error if the runtime does not answer.
    pub async fn ping(&self, runtime_id: RuntimeId) -> ExecutionResult<()> {
        let connection = self.inner.connection(runtime_id)?;
        connection
            .request(
                None,
                Command::Ping,
                Vec::new(),
                Some(self.inner.config.ping_timeout()),
            )
            .await
            .map(|_| ())
    }

    /// Ping the runtime hosting `snap_id`.
    ///
    /// # Errors
    ///
    /// As [`Self::ping`], or [`ExecutionError::NotRunning`].
    pub async fn ping_snap(&self, snap_id: &SnapId) -> ExecutionResult<()> {
        let runtime_id = self
            .runtime_for(snap_id)
            .ok_or_else(|| ExecutionError::NotRunning(snap_id.clone()))?;
        self.ping(runtime_id).await
    }

    /// Tear a runtime down. Every pending request on it fails with
    /// [`ExecutionError::Terminated`] before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::UnknownRuntime`] if there is no such runtime.
    #[instrument(skip(self))]
    pub async fn terminate(&self, runtime_id: RuntimeId) -> ExecutionResult<()> {
        let connection = self
            .inner
            .unregister(runtime_id)
            .ok_or(ExecutionError::UnknownRuntime(runtime_id))?;
        connection.close("terminated by host");

        // Polite request; the runtime is torn down regardless.
        match Frame::command(&CommandRequest {
            id: 0,
            command: Command::Terminate,
            params: Vec::new(),
        }) {
            Ok(frame) => {
                connection.send(frame);
            },
            Err(e) => warn!(error = %e, "Failed to encode terminate"),
        }
        let snap_ids = connection.snaps();
        connection.shutdown(self.inner.config.ping_timeout()).await;

        info!(%runtime_id, snaps = snap_ids.len(), "Runtime terminated");
        self.inner.emit(ExecutionEvent::RuntimeTerminated {
            runtime_id,
            snap_ids,
            reason: "terminated by host".into(),
            unexpected: false,
        });
        Ok(())
    }

    /// Terminate the runtime hosting `snap_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::NotRunning`] if the snap is not loaded.
    pub async fn terminate_snap(&self, snap_id: &SnapId) -> ExecutionResult<()> {
        let runtime_id = self
            .runtime_for(snap_id)
            .ok_or_else(|| ExecutionError::NotRunning(snap_id.clone()))?;
        self.terminate(runtime_id).await
    }

    /// Terminate every runtime.
    pub async fn terminate_all(&self) {
        let ids: Vec<RuntimeId> = lock(&self.inner.runtimes).keys().copied().collect();
        for runtime_id in ids {
            if let Err(e) = self.terminate(runtime_id).await {
                debug!(%runtime_id, error = %e, "Runtime already gone");
            }
        }
    }

    /// Pause the deadlines of `snap_id`'s pending requests, including ones
    /// sent before the matching [`Self::resume_timers`].
    ///
    /// Suspensions nest: deadlines run again only once every suspension has
    /// been resumed.
    pub fn suspend_timers(&self, snap_id: &SnapId) {
        if let Ok(connection) = self.inner.connection_for(snap_id) {
            let count = connection.suspend(snap_id);
            debug!(snap_id = %snap_id, count, "Request timers suspended");
        }
    }

    /// Close one suspension opened by [`Self::suspend_timers`].
    pub fn resume_timers(&self, snap_id: &SnapId) {
        if let Ok(connection) = self.inner.connection_for(snap_id) {
            let count = connection.resume(snap_id);
            debug!(snap_id = %snap_id, count, "Request timers resumed");
        }
    }

    /// Number of open timer suspensions for `snap_id`.
    #[must_use]
    pub fn timer_suspensions(&self, snap_id: &SnapId) -> usize {
        self.inner
            .connection_for(snap_id)
            .map_or(0, |connection| connection.suspension_depth(snap_id))
    }

    /// A handle for pausing `snap_id`'s deadlines from elsewhere.
    #[must_use]
    pub fn request_timers(&self, snap_id: &SnapId) -> RequestTimers {
        RequestTimers {
            inner: Arc::downgrade(&self.inner),
            snap_id: snap_id.clone(),
        }
    }
}

/// Reads frames from one runtime until the stream ends.
async fn read_loop(
    inner: Weak<Inner>,
    connection: Arc<Connection>,
    mut reader: FrameReader<BoxedReader>,
) {
    let runtime_id = connection.id();
    let reason = loop {
        let frame = match next_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "runtime closed the channel".to_string(),
            Err(e) => break format!("channel error: {e}"),
        };
        let Some(service) = inner.upgrade() else {
            return;
        };
        match frame {
            Frame::Command(data) => match serde_json::from_value::<RuntimeMessage>(data) {
                Ok(RuntimeMessage::Response(response)) => connection.resolve(response),
                Ok(RuntimeMessage::Notification(notification)) => {
                    service.on_notification(&connection, notification);
                },
                Err(e) => warn!(%runtime_id, error = %e, "Dropping malformed command message"),
            },
            Frame::Rpc(data) => match serde_json::from_value::<RpcRequest>(data) {
                Ok(request) => serve_rpc(&service, &connection, request),
                Err(e) => warn!(%runtime_id, error = %e, "Dropping malformed RPC request"),
            },
            Frame::Syn | Frame::Ack => debug!(%runtime_id, "Ignoring handshake frame after setup"),
        }
    };

    if connection.is_closed() {
        return;
    }
    if let Some(service) = inner.upgrade() {
        service.runtime_lost(runtime_id, reason).await;
    }
}

fn serve_rpc(inner: &Arc<Inner>, connection: &Arc<Connection>, request: RpcRequest) {
    let RpcRequest {
        id,
        snap_id,
        method,
        params,
    } = request;
    if !connection.hosts(&snap_id) {
        warn!(
            runtime_id = %connection.id(),
            snap_id = %snap_id,
            "RPC from a snap this runtime does not host"
        );
        let error = JsonRpcError::new(format!("unknown snap: {snap_id}"))
            .with_code(JsonRpcError::UNAUTHORIZED);
        reply_rpc(connection, &CommandResponse::err(id, error));
        return;
    }

    let handler = Arc::clone(&inner.rpc_handler);
    let timers = RequestTimers {
        inner: Arc::downgrade(inner),
        snap_id: snap_id.clone(),
    };
    let connection = Arc::clone(connection);
    tokio::spawn(async move {
        debug!(snap_id = %snap_id, id, method = %method, "Serving outbound RPC");
        let response = match handler.handle(&snap_id, &method, params, &timers).await {
            Ok(result) => CommandResponse::ok(id, result),
            Err(error) => CommandResponse::err(id, error),
        };
        reply_rpc(&connection, &response);
    });
}

fn reply_rpc(connection: &Connection, response: &CommandResponse) {
    match Frame::rpc(response) {
        Ok(frame) => {
            if !connection.send(frame) {
                debug!(runtime_id = %connection.id(), id = response.id, "RPC reply after close");
            }
        },
        Err(e) => warn!(error = %e, "Failed to encode RPC reply"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use snaps_core::HandlerType;

    use super::*;
    use crate::backend::{InProcessBackend, RuntimeGuard, RuntimeStreams};
    use crate::protocol::accept_handshake;
    use crate::runtime::{HostRpc, SnapExecutor};

    /// Answers by method name: `echo`, `sleep`, `hang`, `fail`, `call_host`,
    /// `report`.
    #[derive(Default)]
    struct TestExecutor {
        hosts: Mutex<HashMap<SnapId, HostRpc>>,
    }

    #[async_trait]
    impl SnapExecutor for TestExecutor {
        async fn execute(
            &self,
            snap_id: &SnapId,
            source: Vec<u8>,
            _endowments: Vec<String>,
            host: HostRpc,
        ) -> Result<(), JsonRpcError> {
            if source == b"throw" {
                return Err(JsonRpcError::new("init failed"));
            }
            lock(&self.hosts).insert(snap_id.clone(), host);
            Ok(())
        }

        async fn invoke(
            &self,
            snap_id: &SnapId,
            _handler: HandlerType,
            _origin: String,
            request: JsonRpcRequest,
        ) -> Result<Value, JsonRpcError> {
            let host = lock(&self.hosts).get(snap_id).cloned().unwrap();
            let params = request.params_or_null();
            match request.method.as_str() {
                "echo" => Ok(params),
                "sleep" => {
                    let ms = params["ms"].as_u64().unwrap();
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!(ms))
                },
                "hang" => futures::future::pending().await,
                "fail" => Err(JsonRpcError::new("nope").with_code(-32000)),
                "call_host" => host.request("snap_approve", params).await,
                "report" => {
                    host.unhandled_error(&JsonRpcError::new("background failure"));
                    Ok(Value::Null)
                },
                other => Err(JsonRpcError::new(format!("no such method: {other}"))),
            }
        }
    }

    /// Suspends the caller's deadlines while "waiting on the user".
    struct SlowApproval {
        delay: Duration,
    }

    #[async_trait]
    impl RpcHandler for SlowApproval {
        async fn handle(
            &self,
            snap_id: &SnapId,
            method: &str,
            _params: Value,
            timers: &RequestTimers,
        ) -> Result<Value, JsonRpcError> {
            assert_eq!(method, "snap_approve");
            assert_eq!(snap_id.as_str(), "npm:test");
            timers.suspend();
            tokio::time::sleep(self.delay).await;
            timers.resume();
            Ok(json!("approved"))
        }
    }

    fn config(handler_ms: u64) -> ExecutionConfig {
        ExecutionConfig {
            handler_timeouts_ms: BTreeMap::from([("onRpcRequest".to_string(), handler_ms)]),
            ..ExecutionConfig::default()
        }
    }

    fn service(handler_ms: u64) -> ExecutionService {
        ExecutionService::new(
            Arc::new(InProcessBackend::new(TestExecutor::default)),
            config(handler_ms),
        )
    }

    fn snap() -> SnapId {
        SnapId::from_static("npm:test")
    }

    fn request(method: &str, params: Value) -> JsonRpcRequest {
        JsonRpcRequest::new(1, method, Some(params))
    }

    async fn running(service: &ExecutionService) -> RuntimeId {
        service
            .execute_in_new_runtime(&snap(), b"module", Vec::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn invoke_returns_handler_result() {
        let service = service(1_000);
        let runtime_id = running(&service).await;
        assert_eq!(service.runtime_for(&snap()), Some(runtime_id));
        assert_eq!(service.snaps_in(runtime_id), vec![snap()]);

        let value = service
            .invoke(
                &snap(),
                HandlerType::OnRpcRequest,
                "https://dapp.test",
                request("echo", json!({"x": 1})),
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"x": 1}));
        service.ping(runtime_id).await.unwrap();
        service.ping_snap(&snap()).await.unwrap();
        assert!(service.idle_time(&snap()).is_some());
    }

    #[tokio::test]
    async fn snap_errors_come_back_unchanged() {
        let service = service(1_000);
        running(&service).await;
        let err = service
            .invoke(&snap(), HandlerType::OnRpcRequest, "o", request("fail", Value::Null))
            .await
            .unwrap_err();
        let ExecutionError::Snap(inner) = err else {
            panic!("expected a snap error, got {err:?}");
        };
        assert_eq!(inner.message, "nope");
        assert_eq!(inner.code, Some(-32000));
    }

    #[tokio::test]
    async fn responses_route_by_id_out_of_order() {
        let service = service(5_000);
        running(&service).await;
        let sleep = |ms: u64| request("sleep", json!({ "ms": ms }));
        let slow_snap = snap();
        let fast_snap = snap();
        let slow = service.invoke(&slow_snap, HandlerType::OnRpcRequest, "o", sleep(150));
        let fast = service.invoke(&fast_snap, HandlerType::OnRpcRequest, "o", sleep(5));
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap(), json!(150));
        assert_eq!(fast.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn handler_budget_elapses_as_timeout() {
        let service = service(50);
        let runtime_id = running(&service).await;
        let err = service
            .invoke(&snap(), HandlerType::OnRpcRequest, "o", request("hang", Value::Null))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err:?}");
        assert_eq!(service.pending_requests(runtime_id), 0);
        // The runtime survives a handler timeout.
        service.ping(runtime_id).await.unwrap();
    }

    #[tokio::test]
    async fn suspended_timers_do_not_charge_the_snap() {
        let service = ExecutionService::with_rpc_handler(
            Arc::new(InProcessBackend::new(TestExecutor::default)),
            config(100),
            Arc::new(SlowApproval {
                delay: Duration::from_millis(300),
            }),
        );
        running(&service).await;
        let value = service
            .invoke(&snap(), HandlerType::OnRpcRequest, "o", request("call_host", json!({})))
            .await
            .unwrap();
        assert_eq!(value, json!("approved"));
    }

    #[tokio::test]
    async fn nested_suspensions_resume_only_when_all_close() {
        let service = service(100);
        let runtime_id = running(&service).await;
        let first = tokio::spawn({
            let service = service.clone();
            async move {
                service
                    .invoke(&snap(), HandlerType::OnRpcRequest, "o", request("hang", Value::Null))
                    .await
            }
        });
        while service.pending_requests(runtime_id) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        service.suspend_timers(&snap());
        service.suspend_timers(&snap());
        // Sent while suspended, so it starts paused.
        let second = tokio::spawn({
            let service = service.clone();
            async move {
                service
                    .invoke(&snap(), HandlerType::OnRpcRequest, "o", request("hang", Value::Null))
                    .await
            }
        });
        service.resume_timers(&snap());
        assert_eq!(service.timer_suspensions(&snap()), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(service.pending_requests(runtime_id), 2);

        service.resume_timers(&snap());
        assert_eq!(service.timer_suspensions(&snap()), 0);
        assert!(first.await.unwrap().unwrap_err().is_timeout());
        assert!(second.await.unwrap().unwrap_err().is_timeout());
        assert_eq!(service.pending_requests(runtime_id), 0);

        // An unmatched resume is ignored.
        service.resume_timers(&snap());
        assert_eq!(service.timer_suspensions(&snap()), 0);
    }

    #[tokio::test]
    async fn outbound_calls_are_rejected_by_default() {
        let service = service(1_000);
        running(&service).await;
        let err = service
            .invoke(&snap(), HandlerType::OnRpcRequest, "o", request("call_host", json!({})))
            .await
            .unwrap_err();
        let ExecutionError::Snap(inner) = err else {
            panic!("expected a snap error, got {err:?}");
        };
        assert_eq!(inner.code, Some(JsonRpcError::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn terminate_fails_every_pending_request() {
        let service = service(60_000);
        let runtime_id = running(&service).await;
        let mut events = service.subscribe();

        let mut calls = Vec::new();
        for _ in 0..3 {
            let service = service.clone();
            calls.push(tokio::spawn(async move {
                service
                    .invoke(&snap(), HandlerType::OnRpcRequest, "o", request("hang", Value::Null))
                    .await
            }));
        }
        while service.pending_requests(runtime_id) < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        service.terminate(runtime_id).await.unwrap();
        for call in calls {
            assert!(call.await.unwrap().unwrap_err().is_terminated());
        }
        assert!(!service.is_executing(&snap()));
        assert_eq!(service.runtime_count(), 0);

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            ExecutionEvent::RuntimeTerminated { unexpected: false, ref snap_ids, .. }
                if snap_ids == &vec![snap()]
        ));
        assert!(matches!(
            service.terminate(runtime_id).await,
            Err(ExecutionError::UnknownRuntime(_))
        ));
    }

    #[tokio::test]
    async fn loading_twice_is_rejected_and_failures_roll_back() {
        let service = service(1_000);
        let runtime_id = running(&service).await;
        assert!(matches!(
            service.execute_snap(runtime_id, &snap(), b"module", Vec::new()).await,
            Err(ExecutionError::AlreadyExecuting(_))
        ));

        let broken = SnapId::from_static("npm:broken");
        let err = service
            .execute_snap(runtime_id, &broken, b"throw", Vec::new())
            .await
            .unwrap_err();
        assert!(err.is_snap_error());
        assert!(!service.is_executing(&broken));
        assert_eq!(service.snaps_in(runtime_id), vec![snap()]);

        let outcome = service
            .invoke(&broken, HandlerType::OnRpcRequest, "o", request("echo", Value::Null))
            .await;
        assert!(matches!(outcome, Err(ExecutionError::NotRunning(_))));
    }

    #[tokio::test]
    async fn failed_isolated_load_discards_the_runtime() {
        let service = service(1_000);
        let err = service
            .execute_in_new_runtime(&snap(), b"throw", Vec::new())
            .await
            .unwrap_err();
        assert!(err.is_snap_error());
        assert_eq!(service.runtime_count(), 0);
    }

    #[tokio::test]
    async fn unhandled_errors_surface_as_events() {
        let service = service(1_000);
        running(&service).await;
        let mut events = service.subscribe();
        service
            .invoke(&snap(), HandlerType::OnRpcRequest, "o", request("report", Value::Null))
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        let ExecutionEvent::UnhandledError { snap_id, error } = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(snap_id, snap());
        assert_eq!(error.message, "background failure");
    }

    /// A hand-written runtime: answers the first command after a stray and a
    /// malformed response, then hangs up on the second.
    struct FlakyBackend;

    #[async_trait]
    impl IsolationBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn spawn(&self, _runtime_id: &RuntimeId) -> ExecutionResult<RuntimeStreams> {
            let (host_side, runtime_side) = tokio::io::duplex(64 * 1024);
            let (reader, writer) = tokio::io::split(host_side);
            let task = tokio::spawn(async move {
                let (rr, rw) = tokio::io::split(runtime_side);
                let mut reader = frame_reader(rr);
                let mut writer = frame_writer(rw);
                accept_handshake(&mut reader, &mut writer).await.unwrap();

                let Some(Frame::Command(data)) = next_frame(&mut reader).await.unwrap() else {
                    panic!("expected a command");
                };
                let first: CommandRequest = serde_json::from_value(data).unwrap();
                let stray = CommandResponse::ok(first.id.saturating_add(100), json!("stray"));
                send_frame(&mut writer, &Frame::command(&stray).unwrap()).await.unwrap();
                let malformed = Frame::Command(json!({
                    "id": first.id,
                    "result": 1,
                    "error": { "message": "both" }
                }));
                send_frame(&mut writer, &malformed).await.unwrap();
                let reply = CommandResponse::ok(first.id, json!("OK"));
                send_frame(&mut writer, &Frame::command(&reply).unwrap()).await.unwrap();

                let _ = next_frame(&mut reader).await;
            });
            Ok(RuntimeStreams {
                reader: Box::new(reader),
                writer: Box::new(writer),
                guard: RuntimeGuard::task(task),
            })
        }
    }

    #[tokio::test]
    async fn stray_and_malformed_responses_are_dropped_and_loss_is_reported() {
        let service = ExecutionService::new(Arc::new(FlakyBackend), ExecutionConfig::default());
        let mut events = service.subscribe();
        let runtime_id = service.start().await.unwrap();

        service.ping(runtime_id).await.unwrap();
        assert_eq!(service.pending_requests(runtime_id), 0);

        let err = service.ping(runtime_id).await.unwrap_err();
        assert!(err.is_terminated(), "{err:?}");

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event,
            ExecutionEvent::RuntimeTerminated { unexpected: true, .. }
        ));
        assert_eq!(service.runtime_count(), 0);
    }
}
