//! Shared test harness for integration tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use snaps_capabilities::builtin::methods::{DialogHook, InMemoryStateStore, SeedEntropySource};
use snaps_capabilities::{BuiltinHooks, CapabilityRegistry};
use snaps_config::{ControllerConfig, ExecutionConfig};
use snaps_controller::{
    ApprovalDecision, ApprovalHandler, ApprovalRequest, InMemoryLocations, Snap, SnapController,
    SnapRequest, SnapResult,
};
use snaps_core::{HandlerType, JsonRpcRequest, SnapId, SnapManifest};
use snaps_test::fixtures::{ConfirmDialogs, DiscardNotifications};
use snaps_test::{ScriptedExecutor, bundle, manifest_fixture};

/// Origin used for dapp calls.
#[allow(dead_code)]
pub const DAPP: &str = "https://dapp.example";

/// What the mock user answers next.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Planned {
    /// Grant everything asked.
    ApproveAll,
    /// Grant only these permission names.
    ApproveOnly(Vec<String>),
    /// Refuse.
    Deny(String),
}

/// Approval handler answering from a queue; approves everything once the
/// queue is empty. Records every request it sees.
#[derive(Debug, Clone, Default)]
pub struct MockApprovalHandler {
    planned: Arc<Mutex<VecDeque<Planned>>>,
    seen: Arc<Mutex<Vec<ApprovalRequest>>>,
    delay: Option<Duration>,
}

#[allow(dead_code)]
impl MockApprovalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer.
    pub fn then(self, planned: Planned) -> Self {
        self.planned.lock().unwrap().push_back(planned);
        self
    }

    /// Think for `delay` before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests presented so far.
    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApprovalHandler for MockApprovalHandler {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        self.seen.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let planned = self
            .planned
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Planned::ApproveAll);
        match planned {
            Planned::ApproveAll => ApprovalDecision::approve_all(&request),
            Planned::ApproveOnly(names) => ApprovalDecision::Approved {
                permissions: request
                    .permissions
                    .into_iter()
                    .filter(|(name, _)| names.contains(name))
                    .collect(),
            },
            Planned::Deny(reason) => ApprovalDecision::deny(reason),
        }
    }
}

/// A controller over in-process runtimes and an in-memory package registry.
#[allow(dead_code)]
pub struct SnapHost {
    /// The controller under test.
    pub controller: SnapController,
    /// Scripted snap code.
    pub executor: ScriptedExecutor,
    /// Published snaps.
    pub locations: InMemoryLocations,
    /// The mock user.
    pub approvals: MockApprovalHandler,
    /// Backing store of `snap_manageState`.
    pub state: Arc<InMemoryStateStore>,
}

#[allow(dead_code)]
impl SnapHost {
    pub fn new(executor: ScriptedExecutor, approvals: MockApprovalHandler) -> Self {
        Self::build(executor, approvals, ExecutionConfig::default(), Arc::new(ConfirmDialogs))
    }

    /// Override handler timeouts, e.g. `[("onRpcRequest", 200)]`.
    pub fn with_timeouts(
        executor: ScriptedExecutor,
        approvals: MockApprovalHandler,
        timeouts: &[(&str, u64)],
    ) -> Self {
        let config = ExecutionConfig {
            handler_timeouts_ms: timeouts
                .iter()
                .map(|(handler, ms)| ((*handler).to_string(), *ms))
                .collect(),
            ..ExecutionConfig::default()
        };
        Self::build(executor, approvals, config, Arc::new(ConfirmDialogs))
    }

    pub fn build(
        executor: ScriptedExecutor,
        approvals: MockApprovalHandler,
        config: ExecutionConfig,
        dialog: Arc<dyn DialogHook>,
    ) -> Self {
        snaps_test::init_test_tracing();
        let state = Arc::new(InMemoryStateStore::new());
        let hooks = BuiltinHooks {
            dialog,
            state: state.clone(),
            entropy: Arc::new(SeedEntropySource::new([42; 32])),
            notify: Arc::new(DiscardNotifications),
        };
        let registry = CapabilityRegistry::builder()
            .with_builtins(&hooks)
            .build()
            .expect("built-in registry");
        let locations = InMemoryLocations::new();
        let controller = SnapController::builder(executor.backend(), Arc::new(registry))
            .with_state_store(state.clone())
            .with_approval_handler(Arc::new(approvals.clone()))
            .with_location_factory(Arc::new(locations.clone()))
            .with_execution_config(config)
            .with_controller_config(ControllerConfig::default())
            .build();
        Self {
            controller,
            executor,
            locations,
            approvals,
            state,
        }
    }

    /// Publish `id@version`, letting `customize` edit the default manifest.
    pub fn publish(
        &self,
        id: &str,
        version: &str,
        customize: impl FnOnce(&mut SnapManifest),
    ) -> SnapId {
        let snap_id = SnapId::new(id).expect("valid snap id");
        let code = bundle(&format!("{id}@{version}"));
        let mut manifest = manifest_fixture(version, &code);
        customize(&mut manifest);
        self.locations.publish(snap_id.clone(), manifest, code);
        snap_id
    }

    pub async fn install(&self, snap_id: &SnapId, range: &str) -> SnapResult<Snap> {
        let requests = BTreeMap::from([(snap_id.clone(), range.parse().expect("valid range"))]);
        let mut installed = self.controller.install(DAPP, requests).await?;
        Ok(installed.remove(snap_id).expect("installed snap is returned"))
    }

    /// `onRpcRequest` from [`DAPP`].
    pub async fn call(
        &self,
        snap_id: &SnapId,
        method: &str,
        params: Option<Value>,
    ) -> SnapResult<Value> {
        self.controller
            .handle_request(SnapRequest::new(
                snap_id.clone(),
                DAPP,
                HandlerType::OnRpcRequest,
                JsonRpcRequest::new(1, method, params),
            ))
            .await
    }
}
