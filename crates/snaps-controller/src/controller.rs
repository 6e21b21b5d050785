//! The snap lifecycle state machine.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use semver::VersionReq;
use serde_json::Value;
use snaps_capabilities::builtin::endowments::{
    CRONJOB, Cronjob, cronjobs_from_caveats, rpc_origin_admits,
};
use snaps_capabilities::builtin::methods::{InMemoryStateStore, StateStore};
use snaps_capabilities::{CapabilityRegistry, Grants, InMemoryPermissionStore, PermissionStore};
use snaps_config::{Config, ControllerConfig, ExecutionConfig, IdlePolicy};
use snaps_core::{HandlerType, JsonRpcRequest, PermissionRequest, SnapId, SnapManifest};
use snaps_events::{EventBus, EventMetadata, SnapEvent};
use snaps_execution::backend::IsolationBackend;
use snaps_execution::{ExecutionError, ExecutionEvent, ExecutionService, RuntimeId};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::approval::{ApprovalDecision, ApprovalHandler, ApprovalKind, ApprovalRequest, DenyAll};
use crate::cron::{CronRunner, CronScheduler};
use crate::error::{SnapError, SnapResult};
use crate::location::{LocalLocationFactory, LocationFactory};
use crate::rpc::CapabilityRpc;
use crate::snap::{Snap, SnapStatus, VersionHistoryEntry};

/// Origin used for requests the host itself makes, such as cron jobs.
pub const HOST_ORIGIN: &str = "host";

const EVENT_SOURCE: &str = "snaps-controller";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn metadata() -> EventMetadata {
    EventMetadata::new(EVENT_SOURCE)
}

/// Move `snap` to `next`, refusing illegal steps. Returns the old status.
fn transition(snap: &mut Snap, next: SnapStatus) -> SnapResult<SnapStatus> {
    if !snap.status.can_transition_to(&next) {
        return Err(SnapError::InvalidTransition {
            snap_id: snap.id.clone(),
            from: snap.status.name(),
            to: next.name(),
        });
    }
    Ok(std::mem::replace(&mut snap.status, next))
}

/// An inbound request for one snap handler.
#[derive(Debug, Clone)]
pub struct SnapRequest {
    /// Target snap.
    pub snap_id: SnapId,
    /// Caller: a web origin, another snap's id, or [`HOST_ORIGIN`].
    pub origin: String,
    /// Handler to run.
    pub handler: HandlerType,
    /// Payload.
    pub request: JsonRpcRequest,
}

impl SnapRequest {
    /// Build a request.
    #[must_use]
    pub fn new(
        snap_id: SnapId,
        origin: impl Into<String>,
        handler: HandlerType,
        request: JsonRpcRequest,
    ) -> Self {
        Self {
            snap_id,
            origin: origin.into(),
            handler,
            request,
        }
    }
}

/// Configures and builds a [`SnapController`].
pub struct SnapControllerBuilder {
    backend: Arc<dyn IsolationBackend>,
    registry: Arc<CapabilityRegistry>,
    execution_config: ExecutionConfig,
    config: ControllerConfig,
    permissions: Arc<dyn PermissionStore>,
    state: Arc<dyn StateStore>,
    approval: Arc<dyn ApprovalHandler>,
    locations: Arc<dyn LocationFactory>,
    events: EventBus,
}

impl std::fmt::Debug for SnapControllerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapControllerBuilder")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SnapControllerBuilder {
    /// Use both sections of a loaded [`Config`].
    #[must_use]
    pub fn with_config(mut self, config: &Config) -> Self {
        self.execution_config = config.execution.clone();
        self.config = config.controller.clone();
        self
    }

    /// Execution timeouts.
    #[must_use]
    pub fn with_execution_config(mut self, config: ExecutionConfig) -> Self {
        self.execution_config = config;
        self
    }

    /// Idle policy and ping threshold.
    #[must_use]
    pub fn with_controller_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Where grants live. Defaults to an in-memory store.
    #[must_use]
    pub fn with_permission_store(mut self, store: Arc<dyn PermissionStore>) -> Self {
        self.permissions = store;
        self
    }

    /// Persisted snap state, cleared on removal. Pass the same store the
    /// registry's `snap_manageState` uses.
    #[must_use]
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state = store;
        self
    }

    /// Install/update approval. Defaults to denying everything.
    #[must_use]
    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = handler;
        self
    }

    /// Manifest and bundle source. Defaults to `local:` directories.
    #[must_use]
    pub fn with_location_factory(mut self, factory: Arc<dyn LocationFactory>) -> Self {
        self.locations = factory;
        self
    }

    /// Publish lifecycle events on `bus`.
    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.events = bus;
        self
    }

    /// Build the controller and start watching for runtime failures.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn build(self) -> SnapController {
        let rpc = Arc::new(CapabilityRpc::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.permissions),
        ));
        let execution =
            ExecutionService::with_rpc_handler(self.backend, self.execution_config, rpc);
        let mut execution_events = execution.subscribe();

        let controller = SnapController {
            inner: Arc::new(Inner {
                snaps: Mutex::new(BTreeMap::new()),
                execution,
                registry: self.registry,
                permissions: self.permissions,
                state: self.state,
                approval: self.approval,
                locations: self.locations,
                events: self.events,
                config: self.config,
                cron: CronScheduler::new(),
                next_sequence: AtomicU64::new(0),
                next_request_id: AtomicU64::new(1),
                start_locks: Mutex::new(HashMap::new()),
                watcher: Mutex::new(None),
            }),
        };

        let weak = Arc::downgrade(&controller.inner);
        let watcher = tokio::spawn(async move {
            loop {
                match execution_events.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        SnapController { inner }.on_execution_event(event).await;
                    },
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Execution event watcher lagged; reconciling runtimes");
                        let Some(inner) = weak.upgrade() else { break };
                        SnapController { inner }.reconcile_runtimes().await;
                    },
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *lock(&controller.inner.watcher) = Some(watcher);
        controller
    }
}

struct Inner {
    snaps: Mutex<BTreeMap<SnapId, Snap>>,
    execution: ExecutionService,
    registry: Arc<CapabilityRegistry>,
    permissions: Arc<dyn PermissionStore>,
    state: Arc<dyn StateStore>,
    approval: Arc<dyn ApprovalHandler>,
    locations: Arc<dyn LocationFactory>,
    events: EventBus,
    config: ControllerConfig,
    cron: CronScheduler,
    next_sequence: AtomicU64,
    next_request_id: AtomicU64,
    start_locks: Mutex<HashMap<SnapId, Arc<tokio::sync::Mutex<()>>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Delivers cron jobs through the normal request path.
struct CronDispatch(Weak<Inner>);

#[async_trait]
impl CronRunner for CronDispatch {
    async fn run_job(&self, snap_id: &SnapId, job: &Cronjob) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let controller = SnapController { inner };
        let request = JsonRpcRequest::new(
            controller.next_request_id(),
            job.request.method.clone(),
            job.request.params.clone(),
        );
        let outcome = controller
            .handle_request(SnapRequest::new(
                snap_id.clone(),
                HOST_ORIGIN,
                HandlerType::OnCronjob,
                request,
            ))
            .await;
        if let Err(e) = outcome {
            warn!(snap_id = %snap_id, method = %job.request.method, error = %e, "Cron job failed");
        }
    }
}

/// Owns every installed snap and drives it through its lifecycle.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SnapController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SnapController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapController")
            .field("snaps", &lock(&self.inner.snaps).len())
            .field("execution", &self.inner.execution)
            .finish_non_exhaustive()
    }
}

impl SnapController {
    /// Start configuring a controller over `backend`, with `registry` as the
    /// capability model.
    #[must_use]
    pub fn builder(
        backend: Arc<dyn IsolationBackend>,
        registry: Arc<CapabilityRegistry>,
    ) -> SnapControllerBuilder {
        SnapControllerBuilder {
            backend,
            registry,
            execution_config: ExecutionConfig::default(),
            config: ControllerConfig::default(),
            permissions: Arc::new(InMemoryPermissionStore::new()),
            state: Arc::new(InMemoryStateStore::new()),
            approval: Arc::new(DenyAll),
            locations: Arc::new(LocalLocationFactory),
            events: EventBus::new(),
        }
    }

    /// The lifecycle event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The execution service hosting the snaps.
    #[must_use]
    pub fn execution(&self) -> &ExecutionService {
        &self.inner.execution
    }

    /// The capability registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    /// The permission store.
    #[must_use]
    pub fn permissions(&self) -> &Arc<dyn PermissionStore> {
        &self.inner.permissions
    }

    /// The cron scheduler.
    #[must_use]
    pub fn cron(&self) -> &CronScheduler {
        &self.inner.cron
    }

    fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, event: SnapEvent) {
        self.inner.events.publish(event);
    }

    fn with_snap<R>(
        &self,
        snap_id: &SnapId,
        f: impl FnOnce(&mut Snap) -> SnapResult<R>,
    ) -> SnapResult<R> {
        let mut snaps = lock(&self.inner.snaps);
        let snap = snaps
            .get_mut(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))?;
        f(snap)
    }

    fn start_lock(&self, snap_id: &SnapId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            lock(&self.inner.start_locks)
                .entry(snap_id.clone())
                .or_default(),
        )
    }

    // ------------------------------------------------------------ queries

    /// A copy of the snap record.
    #[must_use]
    pub fn get(&self, snap_id: &SnapId) -> Option<Snap> {
        lock(&self.inner.snaps).get(snap_id).cloned()
    }

    /// Copies of every record, in install order.
    #[must_use]
    pub fn get_all(&self) -> Vec<Snap> {
        let mut all: Vec<Snap> = lock(&self.inner.snaps).values().cloned().collect();
        all.sort_by_key(Snap::sequence);
        all
    }

    /// Whether the snap is installed.
    #[must_use]
    pub fn has(&self, snap_id: &SnapId) -> bool {
        lock(&self.inner.snaps).contains_key(snap_id)
    }

    /// Whether the snap has a live runtime.
    #[must_use]
    pub fn is_running(&self, snap_id: &SnapId) -> bool {
        lock(&self.inner.snaps)
            .get(snap_id)
            .is_some_and(|s| matches!(s.status, SnapStatus::Running { .. }))
    }

    /// Snaps that would accept a request now, in install order.
    #[must_use]
    pub fn runnable_snaps(&self) -> Vec<Snap> {
        let mut runnable: Vec<Snap> = lock(&self.inner.snaps)
            .values()
            .filter(|s| s.is_runnable())
            .cloned()
            .collect();
        runnable.sort_by_key(Snap::sequence);
        runnable
    }

    // ------------------------------------------------------- install/update

    /// Install or update each requested snap to a version in its range.
    ///
    /// Snaps already installed at a matching version are returned as they
    /// are; older ones are updated. If any snap fails, snaps freshly
    /// installed by this call are removed again.
    ///
    /// # Errors
    ///
    /// Returns the first failure.
    #[instrument(skip_all, fields(origin = %origin, count = requests.len()))]
    pub async fn install(
        &self,
        origin: &str,
        requests: BTreeMap<SnapId, VersionReq>,
    ) -> SnapResult<BTreeMap<SnapId, Snap>> {
        let mut results = BTreeMap::new();
        let mut fresh = Vec::new();
        for (snap_id, range) in requests {
            let outcome = match self.get(&snap_id) {
                Some(existing) if range.matches(existing.version()) => Ok(existing),
                Some(_) => self.update(origin, &snap_id, &range).await,
                None => {
                    let outcome = self.install_one(origin, &snap_id, &range).await;
                    if outcome.is_ok() {
                        fresh.push(snap_id.clone());
                    }
                    outcome
                },
            };
            match outcome {
                Ok(snap) => {
                    results.insert(snap_id, snap);
                },
                Err(e) => {
                    for installed in fresh {
                        if let Err(rollback) = self.remove_snap(&installed).await {
                            warn!(
                                snap_id = %installed,
                                error = %rollback,
                                "Install rollback failed"
                            );
                        }
                    }
                    return Err(e);
                },
            }
        }
        Ok(results)
    }

    async fn fetch(
        &self,
        snap_id: &SnapId,
        range: &VersionReq,
    ) -> SnapResult<(SnapManifest, Vec<u8>)> {
        let location = self.inner.locations.create(snap_id)?;
        let manifest = location.manifest().await?;
        if !range.matches(&manifest.version) {
            return Err(SnapError::Validation(format!(
                "{snap_id}@{} does not satisfy {range}",
                manifest.version
            )));
        }
        let bundle = location.fetch(&manifest.source.location.file_path).await?;
        manifest.verify_source(&bundle)?;
        Ok((manifest, bundle))
    }

    async fn install_one(
        &self,
        origin: &str,
        snap_id: &SnapId,
        range: &VersionReq,
    ) -> SnapResult<Snap> {
        let (manifest, bundle) = self.fetch(snap_id, range).await?;
        self.inner
            .registry
            .validate_requested(&manifest.initial_permissions)?;

        {
            let mut snaps = lock(&self.inner.snaps);
            if snaps.contains_key(snap_id) {
                return Err(SnapError::AlreadyInstalled(snap_id.clone()));
            }
            let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
            snaps.insert(
                snap_id.clone(),
                Snap::new(snap_id.clone(), manifest.clone(), bundle, sequence),
            );
        }
        info!(snap_id = %snap_id, version = %manifest.version, origin, "Installing snap");
        self.publish(SnapEvent::SnapInstalling {
            metadata: metadata(),
            snap_id: snap_id.clone(),
            origin: origin.to_string(),
        });

        match self.finish_install(origin, snap_id, &manifest).await {
            Ok(snap) => {
                info!(snap_id = %snap_id, "Snap installed");
                self.publish(SnapEvent::SnapInstalled {
                    metadata: metadata(),
                    snap_id: snap_id.clone(),
                    version: manifest.version.to_string(),
                });
                self.schedule_cron(snap_id).await;
                Ok(snap)
            },
            Err(e) => {
                warn!(snap_id = %snap_id, error = %e, "Install failed");
                lock(&self.inner.snaps).remove(snap_id);
                lock(&self.inner.start_locks).remove(snap_id);
                self.inner.permissions.revoke_all(snap_id).await;
                if let Err(clear) = self.inner.state.clear_state(snap_id).await {
                    debug!(snap_id = %snap_id, error = %clear, "No state to clear");
                }
                self.publish(SnapEvent::SnapInstallFailed {
                    metadata: metadata(),
                    snap_id: snap_id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            },
        }
    }

    async fn finish_install(
        &self,
        origin: &str,
        snap_id: &SnapId,
        manifest: &SnapManifest,
    ) -> SnapResult<Snap> {
        let approved = self
            .approve(
                ApprovalKind::Install,
                origin,
                snap_id,
                manifest,
                manifest.initial_permissions.clone(),
            )
            .await?;
        let grants = self.inner.registry.build_grants(&approved)?;
        self.inner
            .permissions
            .grant_permissions(snap_id, grants)
            .await?;

        let runtime_id = self.launch(snap_id).await?;
        let committed = match self
            .run_lifecycle_hook(snap_id, HandlerType::OnInstall, origin)
            .await
        {
            Ok(()) => self.with_snap(snap_id, |snap| {
                if snap.removing {
                    return Err(SnapError::Uninstalling(snap_id.clone()));
                }
                transition(
                    snap,
                    SnapStatus::Running {
                        runtime_id,
                        started_at: Utc::now(),
                    },
                )?;
                snap.version_history.push(VersionHistoryEntry {
                    origin: origin.to_string(),
                    version: manifest.version.clone(),
                    date: Utc::now(),
                });
                Ok(snap.clone())
            }),
            Err(e) => Err(e),
        };
        if committed.is_err() {
            self.discard_runtime(runtime_id).await;
        }
        committed
    }

    /// Ask for approval of `permissions`. Returns the approved subset.
    async fn approve(
        &self,
        kind: ApprovalKind,
        origin: &str,
        snap_id: &SnapId,
        manifest: &SnapManifest,
        permissions: BTreeMap<String, PermissionRequest>,
    ) -> SnapResult<BTreeMap<String, PermissionRequest>> {
        let request = ApprovalRequest {
            kind,
            snap_id: snap_id.clone(),
            origin: origin.to_string(),
            version: manifest.version.clone(),
            permissions,
        };
        let requested = request.permissions.clone();
        debug!(snap_id = %snap_id, ?kind, count = requested.len(), "Requesting approval");
        match self.inner.approval.request_approval(request).await {
            ApprovalDecision::Approved { permissions } => Ok(permissions
                .into_iter()
                .filter(|(name, _)| requested.contains_key(name))
                .collect()),
            ApprovalDecision::Denied { reason } => Err(SnapError::ApprovalDenied {
                snap_id: snap_id.clone(),
                reason,
            }),
        }
    }

    /// Update an installed snap to a strictly newer version in `range`.
    ///
    /// Grants still requested by the new manifest are kept; permissions the
    /// snap does not hold yet go through approval. If the new version fails
    /// to start, the previous version and grants are restored and the snap
    /// is left stopped.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::Validation`] if the version is not newer, or any
    /// fetch, approval or start failure.
    #[instrument(skip_all, fields(snap_id = %snap_id))]
    pub async fn update(
        &self,
        origin: &str,
        snap_id: &SnapId,
        range: &VersionReq,
    ) -> SnapResult<Snap> {
        let current = self
            .get(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))?;
        if current.removing {
            return Err(SnapError::Uninstalling(snap_id.clone()));
        }
        if current.blocked {
            return Err(SnapError::Blocked(snap_id.clone()));
        }

        let (manifest, bundle) = self.fetch(snap_id, range).await?;
        let old_version = current.version().clone();
        if manifest.version <= old_version {
            return Err(SnapError::Validation(format!(
                "{snap_id}@{} is not newer than installed {old_version}",
                manifest.version
            )));
        }
        self.inner
            .registry
            .validate_requested(&manifest.initial_permissions)?;

        let old_grants = self.inner.permissions.get_permissions(snap_id).await;
        let new_requests: BTreeMap<String, PermissionRequest> = manifest
            .initial_permissions
            .iter()
            .filter(|(name, request)| {
                old_grants
                    .get(*name)
                    .is_none_or(|grant| grant.caveats.as_slice() != request.caveats())
            })
            .map(|(name, request)| (name.clone(), request.clone()))
            .collect();

        let previous = self.with_snap(snap_id, |snap| transition(snap, SnapStatus::Updating))?;
        // No runtime outlives the move to `Updating`.
        if let Some(runtime_id) = previous.runtime_id() {
            self.inner.cron.unschedule(snap_id);
            self.discard_runtime(runtime_id).await;
        }
        info!(from = %old_version, to = %manifest.version, "Updating snap");
        self.publish(SnapEvent::SnapUpdating {
            metadata: metadata(),
            snap_id: snap_id.clone(),
            old_version: old_version.to_string(),
            new_version: manifest.version.to_string(),
        });

        let prepared = self
            .prepare_update(origin, snap_id, &manifest, &old_grants, new_requests)
            .await;
        let grants = match prepared {
            Ok(grants) => grants,
            Err(e) => {
                let was_running = previous.runtime_id().is_some();
                let resting = if was_running {
                    SnapStatus::Stopped
                } else {
                    previous
                };
                match self.with_snap(snap_id, |snap| transition(snap, resting)) {
                    Ok(_) if was_running => self.publish(SnapEvent::SnapStopped {
                        metadata: metadata(),
                        snap_id: snap_id.clone(),
                        reason: format!("update refused: {e}"),
                    }),
                    Ok(_) => {},
                    Err(restore) => {
                        warn!(error = %restore, "Could not restore status after refused update");
                    },
                }
                return Err(e);
            },
        };

        let (old_manifest, old_source) = self.with_snap(snap_id, |snap| {
            let old = (snap.manifest.clone(), Arc::clone(&snap.source));
            snap.manifest = manifest.clone();
            snap.source = Arc::new(bundle);
            Ok(old)
        })?;

        let outcome = match self.replace_grants(snap_id, grants).await {
            Ok(()) => self.start_updated(origin, snap_id, &manifest).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(snap) => {
                info!(version = %manifest.version, "Snap updated");
                self.publish(SnapEvent::SnapUpdated {
                    metadata: metadata(),
                    snap_id: snap_id.clone(),
                    old_version: old_version.to_string(),
                    new_version: manifest.version.to_string(),
                });
                self.schedule_cron(snap_id).await;
                Ok(snap)
            },
            Err(e) => {
                warn!(error = %e, "Update failed; restoring previous version");
                if let Err(restore) = self.replace_grants(snap_id, old_grants).await {
                    warn!(error = %restore, "Could not restore previous grants");
                }
                let restored = self.with_snap(snap_id, |snap| {
                    snap.manifest = old_manifest;
                    snap.source = old_source;
                    transition(snap, SnapStatus::Stopped)
                });
                if restored.is_ok() {
                    self.publish(SnapEvent::SnapStopped {
                        metadata: metadata(),
                        snap_id: snap_id.clone(),
                        reason: format!("update failed: {e}"),
                    });
                }
                Err(e)
            },
        }
    }

    /// Approval and grant computation for an update. Nothing is changed yet.
    async fn prepare_update(
        &self,
        origin: &str,
        snap_id: &SnapId,
        manifest: &SnapManifest,
        old_grants: &Grants,
        new_requests: BTreeMap<String, PermissionRequest>,
    ) -> SnapResult<Grants> {
        let approved = if new_requests.is_empty() {
            BTreeMap::new()
        } else {
            self.approve(ApprovalKind::Update, origin, snap_id, manifest, new_requests)
                .await?
        };
        let mut grants: Grants = old_grants
            .iter()
            .filter(|(name, _)| manifest.initial_permissions.contains_key(*name))
            .map(|(name, grant)| (name.clone(), grant.clone()))
            .collect();
        grants.extend(self.inner.registry.build_grants(&approved)?);
        Ok(grants)
    }

    async fn replace_grants(&self, snap_id: &SnapId, grants: Grants) -> SnapResult<()> {
        self.inner.permissions.revoke_all(snap_id).await;
        self.inner
            .permissions
            .grant_permissions(snap_id, grants)
            .await?;
        Ok(())
    }

    async fn start_updated(
        &self,
        origin: &str,
        snap_id: &SnapId,
        manifest: &SnapManifest,
    ) -> SnapResult<Snap> {
        let runtime_id = self.launch(snap_id).await?;
        let committed = match self
            .run_lifecycle_hook(snap_id, HandlerType::OnUpdate, origin)
            .await
        {
            Ok(()) => self.with_snap(snap_id, |snap| {
                transition(
                    snap,
                    SnapStatus::Running {
                        runtime_id,
                        started_at: Utc::now(),
                    },
                )?;
                snap.version_history.push(VersionHistoryEntry {
                    origin: origin.to_string(),
                    version: manifest.version.clone(),
                    date: Utc::now(),
                });
                Ok(snap.clone())
            }),
            Err(e) => Err(e),
        };
        if committed.is_err() {
            self.discard_runtime(runtime_id).await;
        }
        committed
    }

    /// Load the snap into a fresh runtime with its granted endowments.
    async fn launch(&self, snap_id: &SnapId) -> SnapResult<RuntimeId> {
        let source = self.with_snap(snap_id, |snap| Ok(Arc::clone(&snap.source)))?;
        let endowments = self
            .inner
            .registry
            .endowments_for(self.inner.permissions.as_ref(), snap_id)
            .await;
        debug!(snap_id = %snap_id, ?endowments, "Launching runtime");
        Ok(self
            .inner
            .execution
            .execute_in_new_runtime(snap_id, &source, endowments)
            .await?)
    }

    async fn discard_runtime(&self, runtime_id: RuntimeId) {
        if let Err(e) = self.inner.execution.terminate(runtime_id).await {
            debug!(%runtime_id, error = %e, "Runtime already gone");
        }
    }

    /// Invoke `onInstall`/`onUpdate` if the snap exports it and may receive it.
    async fn run_lifecycle_hook(
        &self,
        snap_id: &SnapId,
        handler: HandlerType,
        origin: &str,
    ) -> SnapResult<()> {
        let exports = self.with_snap(snap_id, |snap| Ok(snap.manifest.exports(handler)))?;
        if !exports
            || !self
                .inner
                .permissions
                .has_permission(snap_id, handler.required_permission())
                .await
        {
            return Ok(());
        }
        let request = JsonRpcRequest::new(self.next_request_id(), handler.as_str(), None);
        self.inner
            .execution
            .invoke(snap_id, handler, origin, request)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------ running

    /// Gate checks shared by every path that would run the snap.
    fn check_available(&self, snap_id: &SnapId) -> SnapResult<Snap> {
        let snaps = lock(&self.inner.snaps);
        let snap = snaps
            .get(snap_id)
            .ok_or_else(|| SnapError::NotFound(snap_id.clone()))?;
        if snap.removing {
            return Err(SnapError::Uninstalling(snap_id.clone()));
        }
        if snap.blocked {
            return Err(SnapError::Blocked(snap_id.clone()));
        }
        if !snap.enabled {
            return Err(SnapError::Disabled(snap_id.clone()));
        }
        match &snap.status {
            SnapStatus::Crashed { reason } => Err(SnapError::Crashed {
                snap_id: snap_id.clone(),
                reason: reason.clone(),
            }),
            SnapStatus::Installing | SnapStatus::Updating => Err(SnapError::NotReady {
                snap_id: snap_id.clone(),
                status: snap.status.name(),
            }),
            SnapStatus::Running { .. } | SnapStatus::Stopped => Ok(snap.clone()),
        }
    }

    /// Start the snap if it is not running.
    ///
    /// # Errors
    ///
    /// Returns the gate error, or the start failure.
    #[instrument(skip_all, fields(snap_id = %snap_id))]
    pub async fn start_snap(&self, snap_id: &SnapId) -> SnapResult<()> {
        self.check_available(snap_id)?;
        self.ensure_running(snap_id).await.map(|_| ())
    }

    /// Running runtime for the snap, starting one lazily. A runtime idle past
    /// the configured threshold is pinged first.
    async fn ensure_running(&self, snap_id: &SnapId) -> SnapResult<RuntimeId> {
        let start_lock = self.start_lock(snap_id);
        let _serialized = start_lock.lock().await;

        let status = self.with_snap(snap_id, |snap| Ok(snap.status.clone()))?;
        match status {
            SnapStatus::Running { runtime_id, .. } => {
                self.ping_if_idle(snap_id, runtime_id).await?;
                return Ok(runtime_id);
            },
            SnapStatus::Stopped => {},
            SnapStatus::Crashed { reason } => {
                return Err(SnapError::Crashed {
                    snap_id: snap_id.clone(),
                    reason,
                });
            },
            other => {
                return Err(SnapError::NotReady {
                    snap_id: snap_id.clone(),
                    status: other.name(),
                });
            },
        }

        let runtime_id = match self.launch(snap_id).await {
            Ok(runtime_id) => runtime_id,
            Err(e) => {
                // Snap code that fails or hangs while loading counts as a crash.
                if matches!(e, SnapError::Plugin(_) | SnapError::Timeout { .. }) {
                    self.crash_stopped(snap_id, format!("failed to start: {e}"));
                }
                return Err(e);
            },
        };

        let committed = self.with_snap(snap_id, |snap| {
            if snap.removing {
                return Err(SnapError::Uninstalling(snap_id.clone()));
            }
            transition(
                snap,
                SnapStatus::Running {
                    runtime_id,
                    started_at: Utc::now(),
                },
            )
        });
        if let Err(e) = committed {
            self.discard_runtime(runtime_id).await;
            return Err(e);
        }
        info!(snap_id = %snap_id, %runtime_id, "Snap started");
        self.publish(SnapEvent::SnapStarted {
            metadata: metadata(),
            snap_id: snap_id.clone(),
            runtime_id: runtime_id.to_string(),
        });
        Ok(runtime_id)
    }

    async fn ping_if_idle(&self, snap_id: &SnapId, runtime_id: RuntimeId) -> SnapResult<()> {
        let threshold = self.inner.config.ping_after_idle();
        let idle = self.inner.execution.idle_time(snap_id);
        if idle.is_none_or(|idle| idle < threshold) {
            return Ok(());
        }
        debug!(snap_id = %snap_id, ?idle, "Pinging idle runtime");
        if let Err(e) = self.inner.execution.ping(runtime_id).await {
            let error = SnapError::from(e);
            self.crash(snap_id, Some(runtime_id), format!("runtime unresponsive: {error}"))
                .await;
            return Err(error);
        }
        Ok(())
    }

    fn crash_stopped(&self, snap_id: &SnapId, reason: String) {
        let crashed = self.with_snap(snap_id, |snap| {
            transition(
                snap,
                SnapStatus::Crashed {
                    reason: reason.clone(),
                },
            )
        });
        if crashed.is_ok() {
            warn!(snap_id = %snap_id, %reason, "Snap crashed");
            self.inner.cron.unschedule(snap_id);
            self.publish(SnapEvent::SnapCrashed {
                metadata: metadata(),
                snap_id: snap_id.clone(),
                reason,
            });
        }
    }

    /// Mark a running snap crashed and tear its runtime down. With
    /// `runtime_id`, only if the snap still runs on that runtime.
    async fn crash(&self, snap_id: &SnapId, runtime_id: Option<RuntimeId>, reason: String) -> bool {
        let crashed = {
            let mut snaps = lock(&self.inner.snaps);
            match snaps.get_mut(snap_id) {
                Some(snap) => match snap.status {
                    SnapStatus::Running {
                        runtime_id: current,
                        ..
                    } if runtime_id.is_none_or(|r| r == current) => {
                        snap.status = SnapStatus::Crashed {
                            reason: reason.clone(),
                        };
                        Some(current)
                    },
                    _ => None,
                },
                None => None,
            }
        };
        let Some(current) = crashed else {
            return false;
        };
        warn!(snap_id = %snap_id, runtime_id = %current, %reason, "Snap crashed");
        self.inner.cron.unschedule(snap_id);
        self.discard_runtime(current).await;
        self.publish(SnapEvent::SnapCrashed {
            metadata: metadata(),
            snap_id: snap_id.clone(),
            reason,
        });
        true
    }

    /// Crash every running snap whose runtime the execution service no
    /// longer has. Covers runtime losses whose events were missed. Returns
    /// how many snaps crashed.
    pub async fn reconcile_runtimes(&self) -> usize {
        let running: Vec<(SnapId, RuntimeId)> = lock(&self.inner.snaps)
            .values()
            .filter_map(|snap| Some((snap.id.clone(), snap.status.runtime_id()?)))
            .collect();
        let mut crashed = 0usize;
        for (snap_id, runtime_id) in running {
            if self.inner.execution.runtime_for(&snap_id) == Some(runtime_id) {
                continue;
            }
            if self
                .crash(&snap_id, Some(runtime_id), "runtime lost".to_string())
                .await
            {
                crashed = crashed.saturating_add(1);
            }
        }
        if crashed > 0 {
            info!(crashed, "Reconciled snaps with lost runtimes");
        }
        crashed
    }

    async fn on_execution_event(&self, event: ExecutionEvent) {
        match event {
            ExecutionEvent::UnhandledError { snap_id, error } => {
                self.crash(&snap_id, None, format!("unhandled error: {error}"))
                    .await;
            },
            ExecutionEvent::RuntimeTerminated {
                runtime_id,
                snap_ids,
                reason,
                unexpected: true,
            } => {
                for snap_id in snap_ids {
                    self.crash(
                        &snap_id,
                        Some(runtime_id),
                        format!("runtime terminated: {reason}"),
                    )
                    .await;
                }
            },
            ExecutionEvent::RuntimeTerminated { .. } => {},
            ExecutionEvent::OutboundRequest { snap_id } => {
                debug!(snap_id = %snap_id, "Snap network request started");
            },
            ExecutionEvent::OutboundResponse { snap_id } => {
                debug!(snap_id = %snap_id, "Snap network request finished");
            },
        }
    }

    /// Route a request to a snap handler.
    ///
    /// Gates, in order: installed, not blocked, enabled, not crashed, handler
    /// exported, handler permission granted (and for `onRpcRequest` the
    /// `rpcOrigin` caveat admits the caller). The snap is then started
    /// lazily and invoked. A timeout or lost runtime crashes the snap.
    ///
    /// # Errors
    ///
    /// Returns the failing gate, the snap's own error as
    /// [`SnapError::Plugin`], or the infrastructure failure.
    #[instrument(
        skip(self, request),
        fields(snap_id = %request.snap_id, handler = %request.handler)
    )]
    pub async fn handle_request(&self, request: SnapRequest) -> SnapResult<Value> {
        let SnapRequest {
            snap_id,
            origin,
            handler,
            request,
        } = request;

        let snap = self.check_available(&snap_id)?;
        if !snap.manifest.exports(handler) {
            return Err(SnapError::Validation(format!(
                "{snap_id} does not export {handler}"
            )));
        }
        let permission = handler.required_permission();
        let Some(grant) = self
            .inner
            .permissions
            .get_permission(&snap_id, permission)
            .await
        else {
            return Err(SnapError::PermissionDenied(format!(
                "{snap_id} is not permitted to handle {handler}: missing {permission}"
            )));
        };
        if handler == HandlerType::OnRpcRequest && !rpc_origin_admits(&grant.caveats, &origin) {
            return Err(SnapError::PermissionDenied(format!(
                "{origin} is not permitted to call {snap_id}"
            )));
        }

        let runtime_id = self.ensure_running(&snap_id).await?;
        match self
            .inner
            .execution
            .invoke(&snap_id, handler, &origin, request)
            .await
        {
            Ok(value) => Ok(value),
            Err(e) => {
                if matches!(
                    e,
                    ExecutionError::Timeout { .. }
                        | ExecutionError::Terminated { .. }
                        | ExecutionError::NotRunning(_)
                ) {
                    self.crash(&snap_id, Some(runtime_id), e.to_string()).await;
                }
                Err(e.into())
            },
        }
    }

    // ------------------------------------------------------------ stopping

    /// Tear down the snap's runtime, keeping the record. No-op when not
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`].
    pub async fn stop_snap(&self, snap_id: &SnapId) -> SnapResult<()> {
        self.stop_with_reason(snap_id, "stopped by host").await.map(|_| ())
    }

    async fn stop_with_reason(&self, snap_id: &SnapId, reason: &str) -> SnapResult<bool> {
        let runtime_id = self.with_snap(snap_id, |snap| {
            let Some(runtime_id) = snap.status.runtime_id() else {
                return Ok(None);
            };
            transition(snap, SnapStatus::Stopped)?;
            Ok(Some(runtime_id))
        })?;
        let Some(runtime_id) = runtime_id else {
            return Ok(false);
        };
        self.discard_runtime(runtime_id).await;
        info!(snap_id = %snap_id, reason, "Snap stopped");
        self.publish(SnapEvent::SnapStopped {
            metadata: metadata(),
            snap_id: snap_id.clone(),
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// Stop every running snap.
    pub async fn stop_all_snaps(&self) {
        let running: Vec<SnapId> = lock(&self.inner.snaps)
            .values()
            .filter(|s| matches!(s.status, SnapStatus::Running { .. }))
            .map(|s| s.id.clone())
            .collect();
        for snap_id in running {
            if let Err(e) = self.stop_with_reason(&snap_id, "stopping all snaps").await {
                debug!(snap_id = %snap_id, error = %e, "Snap went away while stopping");
            }
        }
    }

    /// Operator recovery: clear a crash (or bounce a running snap) and start
    /// it on a fresh runtime.
    ///
    /// # Errors
    ///
    /// Returns the gate or start failure.
    #[instrument(skip_all, fields(snap_id = %snap_id))]
    pub async fn restart_snap(&self, snap_id: &SnapId) -> SnapResult<()> {
        let status = self.with_snap(snap_id, |snap| {
            if snap.removing {
                return Err(SnapError::Uninstalling(snap_id.clone()));
            }
            if snap.blocked {
                return Err(SnapError::Blocked(snap_id.clone()));
            }
            if !snap.enabled {
                return Err(SnapError::Disabled(snap_id.clone()));
            }
            if let SnapStatus::Crashed { .. } = snap.status {
                transition(snap, SnapStatus::Stopped)
            } else {
                Ok(snap.status.clone())
            }
        })?;
        match status {
            SnapStatus::Crashed { reason } => {
                info!(%reason, "Clearing crash");
                self.publish(SnapEvent::SnapStopped {
                    metadata: metadata(),
                    snap_id: snap_id.clone(),
                    reason: format!("restarting after crash: {reason}"),
                });
            },
            SnapStatus::Running { .. } => {
                self.stop_with_reason(snap_id, "restarting").await?;
            },
            SnapStatus::Stopped => {},
            other => {
                return Err(SnapError::NotReady {
                    snap_id: snap_id.clone(),
                    status: other.name(),
                });
            },
        }
        self.ensure_running(snap_id).await?;
        self.schedule_cron(snap_id).await;
        Ok(())
    }

    // ------------------------------------------------------ administration

    /// Accept requests again.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`] or [`SnapError::Uninstalling`].
    pub async fn enable_snap(&self, snap_id: &SnapId) -> SnapResult<()> {
        let changed = self.with_snap(snap_id, |snap| {
            if snap.removing {
                return Err(SnapError::Uninstalling(snap_id.clone()));
            }
            Ok(!std::mem::replace(&mut snap.enabled, true))
        })?;
        if changed {
            info!(snap_id = %snap_id, "Snap enabled");
            self.publish(SnapEvent::SnapEnabled {
                metadata: metadata(),
                snap_id: snap_id.clone(),
            });
            self.schedule_cron(snap_id).await;
        }
        Ok(())
    }

    /// Stop the snap and reject requests with [`SnapError::Disabled`].
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`].
    pub async fn disable_snap(&self, snap_id: &SnapId) -> SnapResult<()> {
        let changed =
            self.with_snap(snap_id, |snap| Ok(std::mem::replace(&mut snap.enabled, false)))?;
        if !changed {
            return Ok(());
        }
        self.inner.cron.unschedule(snap_id);
        self.stop_with_reason(snap_id, "disabled").await?;
        info!(snap_id = %snap_id, "Snap disabled");
        self.publish(SnapEvent::SnapDisabled {
            metadata: metadata(),
            snap_id: snap_id.clone(),
        });
        Ok(())
    }

    /// Stop the snap and reject requests with [`SnapError::Blocked`].
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`].
    pub async fn block_snap(&self, snap_id: &SnapId, reason: Option<String>) -> SnapResult<()> {
        let changed = self.with_snap(snap_id, |snap| {
            snap.blocked_reason.clone_from(&reason);
            Ok(!std::mem::replace(&mut snap.blocked, true))
        })?;
        if !changed {
            return Ok(());
        }
        self.inner.cron.unschedule(snap_id);
        self.stop_with_reason(snap_id, "blocked").await?;
        warn!(snap_id = %snap_id, reason = ?reason, "Snap blocked");
        self.publish(SnapEvent::SnapBlocked {
            metadata: metadata(),
            snap_id: snap_id.clone(),
            reason,
        });
        Ok(())
    }

    /// Lift a block.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`].
    pub async fn unblock_snap(&self, snap_id: &SnapId) -> SnapResult<()> {
        let changed = self.with_snap(snap_id, |snap| {
            snap.blocked_reason = None;
            Ok(std::mem::replace(&mut snap.blocked, false))
        })?;
        if changed {
            info!(snap_id = %snap_id, "Snap unblocked");
            self.publish(SnapEvent::SnapUnblocked {
                metadata: metadata(),
                snap_id: snap_id.clone(),
            });
            self.schedule_cron(snap_id).await;
        }
        Ok(())
    }

    /// Uninstall: drop all references, terminate the runtime, clear state,
    /// revoke grants and delete the record.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`] or [`SnapError::Uninstalling`] if a
    /// removal is already under way.
    #[instrument(skip_all, fields(snap_id = %snap_id))]
    pub async fn remove_snap(&self, snap_id: &SnapId) -> SnapResult<()> {
        self.with_snap(snap_id, |snap| {
            if snap.removing {
                return Err(SnapError::Uninstalling(snap_id.clone()));
            }
            snap.removing = true;
            snap.active_references = 0;
            Ok(())
        })?;
        self.inner.cron.unschedule(snap_id);
        self.stop_with_reason(snap_id, "removed").await?;

        if let Err(e) = self.inner.state.clear_state(snap_id).await {
            warn!(error = %e, "Failed to clear state of removed snap");
        }
        self.inner.permissions.revoke_all(snap_id).await;
        lock(&self.inner.snaps).remove(snap_id);
        lock(&self.inner.start_locks).remove(snap_id);

        info!("Snap removed");
        self.publish(SnapEvent::SnapRemoved {
            metadata: metadata(),
            snap_id: snap_id.clone(),
        });
        Ok(())
    }

    /// Wipe the snap's persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`] or the store's failure.
    pub async fn clear_state(&self, snap_id: &SnapId) -> SnapResult<()> {
        if !self.has(snap_id) {
            return Err(SnapError::NotFound(snap_id.clone()));
        }
        self.inner.state.clear_state(snap_id).await?;
        self.publish(SnapEvent::SnapStateCleared {
            metadata: metadata(),
            snap_id: snap_id.clone(),
        });
        Ok(())
    }

    // ---------------------------------------------------------- references

    /// Hold the snap alive. Returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`] or [`SnapError::Uninstalling`].
    pub fn increment_active_references(&self, snap_id: &SnapId) -> SnapResult<u64> {
        self.with_snap(snap_id, |snap| {
            if snap.removing {
                return Err(SnapError::Uninstalling(snap_id.clone()));
            }
            snap.active_references = snap.active_references.saturating_add(1);
            Ok(snap.active_references)
        })
    }

    /// Release a hold. Reaching zero stops the snap under
    /// [`IdlePolicy::StopWhenUnreferenced`]; it never removes it.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`], or [`SnapError::Validation`] if no
    /// reference is held.
    pub async fn decrement_active_references(&self, snap_id: &SnapId) -> SnapResult<u64> {
        let stop_on_idle = self.inner.config.idle_policy == IdlePolicy::StopWhenUnreferenced;
        let (count, idle) = self.with_snap(snap_id, |snap| {
            let count = snap.active_references.checked_sub(1).ok_or_else(|| {
                SnapError::Validation(format!("{snap_id} has no active references"))
            })?;
            snap.active_references = count;
            let idle = count == 0
                && stop_on_idle
                && !snap.removing
                && matches!(snap.status, SnapStatus::Running { .. });
            Ok((count, idle))
        })?;
        if idle {
            self.stop_with_reason(snap_id, "no active references").await?;
        }
        Ok(count)
    }

    // ------------------------------------------------------------ plumbing

    async fn schedule_cron(&self, snap_id: &SnapId) {
        let exports = self
            .get(snap_id)
            .is_some_and(|s| s.manifest.exports(HandlerType::OnCronjob));
        if !exports {
            return;
        }
        let Some(grant) = self.inner.permissions.get_permission(snap_id, CRONJOB).await else {
            return;
        };
        match cronjobs_from_caveats(&grant.caveats) {
            Ok(jobs) => self.inner.cron.schedule(
                snap_id,
                jobs,
                Arc::new(CronDispatch(Arc::downgrade(&self.inner))),
            ),
            Err(e) => warn!(snap_id = %snap_id, error = %e, "Ignoring malformed cron grant"),
        }
    }

    /// Stop cron jobs, every snap and every runtime.
    pub async fn shutdown(&self) {
        info!("Shutting down snap controller");
        self.inner.cron.clear();
        self.stop_all_snaps().await;
        self.inner.execution.terminate_all().await;
        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
