//! End-to-end install flow: approval, grants, and restricted host calls.

mod common;

use common::{MockApprovalHandler, Planned, SnapHost};
use serde_json::json;
use snaps_capabilities::PermissionStore;
use snaps_capabilities::builtin::endowments::{LIFECYCLE_HOOKS, RPC};
use snaps_capabilities::builtin::methods::{
    GET_BIP44_ENTROPY, MANAGE_STATE, PERMITTED_COIN_TYPES_CAVEAT, StateStore,
};
use snaps_controller::{ApprovalKind, ErrorKind, SnapStatus};
use snaps_core::{Caveat, HandlerType, JsonRpcError, PermissionRequest};
use snaps_test::{Behavior, ScriptedExecutor};

#[tokio::test]
async fn approved_install_can_call_granted_method() {
    let executor = ScriptedExecutor::new().on(
        "save",
        Behavior::CallHost {
            method: MANAGE_STATE.into(),
            params: json!({ "operation": "update", "newState": { "saved": true } }),
        },
    );
    let host = SnapHost::new(executor, MockApprovalHandler::new());
    let id = host.publish("npm:storage", "1.0.0", |m| {
        m.initial_permissions
            .insert(MANAGE_STATE.into(), PermissionRequest::bare());
    });

    let snap = host.install(&id, "^1.0.0").await.unwrap();
    assert_eq!(snap.status().name(), "running");

    let seen = host.approvals.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind, ApprovalKind::Install);
    assert!(seen[0].permissions.contains_key(MANAGE_STATE));

    assert_eq!(host.call(&id, "save", None).await.unwrap(), json!(null));
    assert_eq!(
        host.state.get_state(&id).await.unwrap(),
        Some(json!({ "saved": true }))
    );
}

#[tokio::test]
async fn denied_approval_installs_nothing() {
    let approvals = MockApprovalHandler::new().then(Planned::Deny("not today".into()));
    let host = SnapHost::new(ScriptedExecutor::new(), approvals);
    let id = host.publish("npm:denied", "1.0.0", |_| {});

    let err = host.install(&id, "*").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ApprovalDenied);
    assert!(!host.controller.has(&id));
    assert!(host.executor.loads().is_empty());
    assert!(
        host.controller
            .permissions()
            .get_permissions(&id)
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn partial_approval_skips_ungranted_hooks() {
    let host = SnapHost::new(
        ScriptedExecutor::new(),
        MockApprovalHandler::new().then(Planned::ApproveOnly(vec![RPC.into()])),
    );
    let id = host.publish("npm:partial", "1.0.0", |m| {
        m.initial_permissions
            .insert(LIFECYCLE_HOOKS.into(), PermissionRequest::bare());
        m.handlers.insert(HandlerType::OnInstall);
    });

    host.install(&id, "*").await.unwrap();
    assert_eq!(host.executor.call_count("onInstall"), 0);
    let permissions = host.controller.permissions();
    assert!(permissions.has_permission(&id, RPC).await);
    assert!(!permissions.has_permission(&id, LIFECYCLE_HOOKS).await);
}

#[tokio::test]
async fn granted_lifecycle_hook_runs_once() {
    let host = SnapHost::new(ScriptedExecutor::new(), MockApprovalHandler::new());
    let id = host.publish("npm:hooked", "1.0.0", |m| {
        m.initial_permissions
            .insert(LIFECYCLE_HOOKS.into(), PermissionRequest::bare());
        m.handlers.insert(HandlerType::OnInstall);
    });

    host.install(&id, "*").await.unwrap();
    let calls = host.executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].handler, HandlerType::OnInstall);
}

#[tokio::test]
async fn ungranted_method_is_unauthorized() {
    let executor = ScriptedExecutor::new().on(
        "peek",
        Behavior::CallHost {
            method: MANAGE_STATE.into(),
            params: json!({ "operation": "get" }),
        },
    );
    let host = SnapHost::new(executor, MockApprovalHandler::new());
    let id = host.publish("npm:nosy", "1.0.0", |_| {});
    host.install(&id, "*").await.unwrap();

    let err = host.call(&id, "peek", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Plugin);
    assert_eq!(err.to_json_rpc().code, Some(JsonRpcError::UNAUTHORIZED));
    // A rejected host call is the snap's error, not a crash.
    assert!(matches!(
        host.controller.get(&id).unwrap().status(),
        SnapStatus::Running { .. }
    ));
}

#[tokio::test]
async fn caveat_limits_entropy_to_permitted_coin_types() {
    let executor = ScriptedExecutor::new()
        .on(
            "ethereum",
            Behavior::CallHost {
                method: GET_BIP44_ENTROPY.into(),
                params: json!({ "coinType": 60 }),
            },
        )
        .on(
            "bitcoin",
            Behavior::CallHost {
                method: GET_BIP44_ENTROPY.into(),
                params: json!({ "coinType": 1 }),
            },
        );
    let host = SnapHost::new(executor, MockApprovalHandler::new());
    let id = host.publish("npm:keys", "1.0.0", |m| {
        m.initial_permissions.insert(
            GET_BIP44_ENTROPY.into(),
            PermissionRequest::with_caveats(vec![Caveat::new(
                PERMITTED_COIN_TYPES_CAVEAT,
                json!([{ "coinType": 60 }]),
            )]),
        );
    });
    host.install(&id, "*").await.unwrap();

    let entropy = host.call(&id, "ethereum", None).await.unwrap();
    assert_eq!(entropy["coinType"], json!(60));
    assert!(entropy["entropy"].as_str().unwrap().starts_with("0x"));

    let err = host.call(&id, "bitcoin", None).await.unwrap_err();
    assert_eq!(err.to_json_rpc().code, Some(JsonRpcError::UNAUTHORIZED));
}

#[tokio::test]
async fn update_asks_only_for_new_permissions() {
    let host = SnapHost::new(ScriptedExecutor::new(), MockApprovalHandler::new());
    let id = host.publish("npm:growing", "1.0.0", |_| {});
    host.install(&id, "*").await.unwrap();

    host.publish("npm:growing", "1.1.0", |m| {
        m.initial_permissions
            .insert(MANAGE_STATE.into(), PermissionRequest::bare());
    });
    let updated = host
        .controller
        .update(common::DAPP, &id, &"^1.1.0".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(updated.version(), &semver::Version::new(1, 1, 0));
    assert_eq!(updated.version_history().len(), 2);

    let seen = host.approvals.requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].kind, ApprovalKind::Update);
    assert_eq!(seen[1].permissions.keys().collect::<Vec<_>>(), vec![MANAGE_STATE]);
    assert!(host.controller.permissions().has_permission(&id, RPC).await);
}

#[tokio::test]
async fn slow_approval_does_not_eat_hook_budget() {
    let host = SnapHost::with_timeouts(
        ScriptedExecutor::new(),
        MockApprovalHandler::new().with_delay(std::time::Duration::from_millis(300)),
        &[("onInstall", 100)],
    );
    let id = host.publish("npm:patient", "1.0.0", |m| {
        m.initial_permissions
            .insert(LIFECYCLE_HOOKS.into(), PermissionRequest::bare());
        m.handlers.insert(HandlerType::OnInstall);
    });

    host.install(&id, "*").await.unwrap();
    assert_eq!(host.executor.call_count("onInstall"), 1);
}
