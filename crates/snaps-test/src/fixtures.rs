//! Test fixtures for bundles, manifests and the capability registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use snaps_capabilities::builtin::endowments::{
    CHAIN_NAMESPACES_CAVEAT, CRONJOB_CAVEAT, RPC, RPC_ORIGIN_CAVEAT,
};
use snaps_capabilities::builtin::methods::{
    DialogHook, DialogRequest, Notification, NotificationHook, SeedEntropySource, StateStore,
};
use snaps_capabilities::{BuiltinHooks, CapabilityRegistry, CapabilityResult};
use snaps_core::{
    Caveat, HandlerType, PermissionRequest, SnapId, SnapLocationRef, SnapManifest, SnapSource,
    shasum_of,
};

/// Bundle path used by [`manifest_fixture`].
pub const BUNDLE_PATH: &str = "dist/bundle.js";

/// Distinct bundle bytes for a test snap.
#[must_use]
pub fn bundle(name: &str) -> Vec<u8> {
    format!("module.exports.snap = {name:?};").into_bytes()
}

/// `rpcOrigin` caveat.
#[must_use]
pub fn rpc_origin_caveat(dapps: bool, snaps: bool) -> Caveat {
    Caveat::new(RPC_ORIGIN_CAVEAT, json!({ "dapps": dapps, "snaps": snaps }))
}

/// `snapCronjob` caveat with one job.
#[must_use]
pub fn cronjob_caveat(interval_ms: u64, method: &str) -> Caveat {
    Caveat::new(
        CRONJOB_CAVEAT,
        json!({ "jobs": [{ "intervalMs": interval_ms, "request": { "method": method } }] }),
    )
}

/// `chainNamespaces` caveat.
#[must_use]
pub fn namespaces_caveat(namespaces: &[&str]) -> Caveat {
    Caveat::new(CHAIN_NAMESPACES_CAVEAT, json!(namespaces))
}

/// A valid manifest for `bundle` exporting `onRpcRequest` to dapps and snaps.
#[must_use]
pub fn manifest_fixture(version: &str, bundle: &[u8]) -> SnapManifest {
    SnapManifest {
        version: version
            .parse()
            .unwrap_or_else(|_| semver::Version::new(1, 0, 0)),
        proposed_name: "Test Snap".to_string(),
        description: None,
        source: SnapSource {
            shasum: shasum_of(bundle),
            location: SnapLocationRef {
                file_path: BUNDLE_PATH.to_string(),
            },
        },
        initial_permissions: BTreeMap::from([(
            RPC.to_string(),
            PermissionRequest::with_caveats(vec![rpc_origin_caveat(true, true)]),
        )]),
        handlers: BTreeSet::from([HandlerType::OnRpcRequest]),
        manifest_version: "0.1".to_string(),
    }
}

/// Dialogs answer `true` immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmDialogs;

#[async_trait]
impl DialogHook for ConfirmDialogs {
    async fn show_dialog(
        &self,
        _snap_id: &SnapId,
        _request: DialogRequest,
    ) -> CapabilityResult<Value> {
        Ok(Value::Bool(true))
    }
}

/// Notifications go nowhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardNotifications;

#[async_trait]
impl NotificationHook for DiscardNotifications {
    async fn notify(&self, _snap_id: &SnapId, _notification: Notification) -> CapabilityResult<()> {
        Ok(())
    }
}

/// A registry with every built-in permission, backed by `state`.
///
/// # Panics
///
/// Panics if the built-in specifications conflict, which is a bug.
#[must_use]
pub fn test_registry(state: Arc<dyn StateStore>) -> Arc<CapabilityRegistry> {
    let hooks = BuiltinHooks {
        dialog: Arc::new(ConfirmDialogs),
        state,
        entropy: Arc::new(SeedEntropySource::new([7; 32])),
        notify: Arc::new(DiscardNotifications),
    };
    #[allow(clippy::expect_used)]
    let registry = CapabilityRegistry::builder()
        .with_builtins(&hooks)
        .build()
        .expect("built-in permissions are consistent");
    Arc::new(registry)
}
