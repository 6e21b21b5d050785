//! A [`SnapExecutor`] driven by a per-method script.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use snaps_core::{HandlerType, JsonRpcError, JsonRpcRequest, SnapId};
use snaps_execution::backend::{InProcessBackend, IsolationBackend};
use snaps_execution::protocol::NotificationMethod;
use snaps_execution::runtime::{ExecutorFactory, HostRpc, SnapExecutor};

/// What the fake snap does when a method is called.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return this value.
    Reply(Value),
    /// Return the request params.
    Echo,
    /// Fail with this snap error.
    Fail(JsonRpcError),
    /// Never answer.
    Hang,
    /// Sleep, then return the value.
    Delay(Duration, Value),
    /// Call the host and return whatever it answers.
    CallHost {
        /// Host method.
        method: String,
        /// Params.
        params: Value,
    },
    /// Report an unhandled error, then return `null`.
    ReportError(JsonRpcError),
    /// Announce this many outbound request/response pairs, then return
    /// `null`.
    Chatter(usize),
}

/// One handler invocation seen by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Target snap.
    pub snap_id: SnapId,
    /// Handler invoked.
    pub handler: HandlerType,
    /// Caller origin.
    pub origin: String,
    /// Request method.
    pub method: String,
    /// Request params, `null` when absent.
    pub params: Value,
}

#[derive(Default)]
struct Script {
    behaviors: HashMap<String, Behavior>,
    failing_sources: Vec<Vec<u8>>,
    calls: Vec<RecordedCall>,
    loads: Vec<(SnapId, Vec<String>)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted stand-in for snap code.
///
/// The script and the call log are shared by every runtime created through
/// [`ScriptedExecutor::backend`]; loaded snaps are per runtime. Methods
/// without a script reply `null`.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<Script>>,
    hosts: Arc<Mutex<HashMap<SnapId, HostRpc>>>,
}

impl std::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let script = lock(&self.script);
        f.debug_struct("ScriptedExecutor")
            .field("methods", &script.behaviors.len())
            .field("calls", &script.calls.len())
            .finish_non_exhaustive()
    }
}

impl ScriptedExecutor {
    /// An executor with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `method`.
    #[must_use]
    pub fn on(self, method: impl Into<String>, behavior: Behavior) -> Self {
        self.set(method, behavior);
        self
    }

    /// Refuse to load `source`.
    #[must_use]
    pub fn fail_loading(self, source: Vec<u8>) -> Self {
        lock(&self.script).failing_sources.push(source);
        self
    }

    /// Change the script of `method` for every runtime.
    pub fn set(&self, method: impl Into<String>, behavior: Behavior) {
        lock(&self.script).behaviors.insert(method.into(), behavior);
    }

    /// Every handler invocation so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.script).calls.clone()
    }

    /// How often `method` was invoked.
    #[must_use]
    pub fn call_count(&self, method: &str) -> usize {
        lock(&self.script)
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Every successful load with the endowments it received.
    #[must_use]
    pub fn loads(&self) -> Vec<(SnapId, Vec<String>)> {
        lock(&self.script).loads.clone()
    }

    /// An executor for a new runtime: same script, no loaded snaps.
    #[must_use]
    pub fn for_runtime(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
            hosts: Arc::default(),
        }
    }

    /// Factory handing each runtime a [`Self::for_runtime`] executor.
    #[must_use]
    pub fn factory(&self) -> impl ExecutorFactory + 'static {
        let template = self.clone();
        move || template.for_runtime()
    }

    /// In-process backend running this script.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn IsolationBackend> {
        Arc::new(InProcessBackend::new(self.factory()))
    }
}

#[async_trait]
impl SnapExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        snap_id: &SnapId,
        source: Vec<u8>,
        endowments: Vec<String>,
        host: HostRpc,
    ) -> Result<(), JsonRpcError> {
        {
            let mut script = lock(&self.script);
            if script.failing_sources.contains(&source) {
                return Err(JsonRpcError::new("snap failed to initialize"));
            }
            script.loads.push((snap_id.clone(), endowments));
        }
        lock(&self.hosts).insert(snap_id.clone(), host);
        Ok(())
    }

    async fn invoke(
        &self,
        snap_id: &SnapId,
        handler: HandlerType,
        origin: String,
        request: JsonRpcRequest,
    ) -> Result<Value, JsonRpcError> {
        let params = request.params_or_null();
        let behavior = {
            let mut script = lock(&self.script);
            script.calls.push(RecordedCall {
                snap_id: snap_id.clone(),
                handler,
                origin,
                method: request.method.clone(),
                params: params.clone(),
            });
            script.behaviors.get(&request.method).cloned()
        };
        let host = lock(&self.hosts).get(snap_id).cloned();

        match behavior.unwrap_or(Behavior::Reply(Value::Null)) {
            Behavior::Reply(value) => Ok(value),
            Behavior::Echo => Ok(params),
            Behavior::Fail(error) => Err(error),
            Behavior::Hang => std::future::pending().await,
            Behavior::Delay(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            },
            Behavior::CallHost { method, params } => match host {
                Some(host) => host.request(&method, params).await,
                None => Err(JsonRpcError::new("snap is not loaded")),
            },
            Behavior::ReportError(error) => {
                if let Some(host) = host {
                    host.unhandled_error(&error);
                }
                Ok(Value::Null)
            },
            Behavior::Chatter(pairs) => {
                if let Some(host) = host {
                    for _ in 0..pairs {
                        host.notify(NotificationMethod::OutboundRequest, Value::Null);
                        host.notify(NotificationMethod::OutboundResponse, Value::Null);
                    }
                }
                Ok(Value::Null)
            },
        }
    }
}
