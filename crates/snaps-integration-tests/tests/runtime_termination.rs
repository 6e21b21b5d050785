//! Every pending request resolves exactly once, including across teardown.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{MockApprovalHandler, SnapHost};
use serde_json::json;
use snaps_config::ExecutionConfig;
use snaps_controller::{ErrorKind, SnapStatus};
use snaps_core::{HandlerType, JsonRpcError, JsonRpcRequest, SnapId};
use snaps_execution::{ExecutionError, ExecutionService, RuntimeId};
use snaps_test::{Behavior, ScriptedExecutor, bundle};

async fn loaded(
    executor: &ScriptedExecutor,
    config: ExecutionConfig,
) -> (ExecutionService, SnapId, RuntimeId) {
    snaps_test::init_test_tracing();
    let service = ExecutionService::new(executor.backend(), config);
    let snap_id = SnapId::from_static("npm:worker");
    let runtime_id = service
        .execute_in_new_runtime(&snap_id, &bundle("worker"), Vec::new())
        .await
        .unwrap();
    (service, snap_id, runtime_id)
}

async fn wait_for_pending(service: &ExecutionService, runtime_id: RuntimeId, count: usize) {
    for _ in 0..300 {
        if service.pending_requests(runtime_id) == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("never saw {count} pending requests");
}

#[tokio::test]
async fn terminate_fails_every_pending_request() {
    const N: u64 = 8;
    let executor = ScriptedExecutor::new().on("wait", Behavior::Hang);
    let (service, snap_id, runtime_id) = loaded(&executor, ExecutionConfig::default()).await;

    let mut pending = Vec::new();
    for id in 0..N {
        let service = service.clone();
        let snap_id = snap_id.clone();
        pending.push(tokio::spawn(async move {
            service
                .invoke(
                    &snap_id,
                    HandlerType::OnRpcRequest,
                    "https://dapp.example",
                    JsonRpcRequest::new(id, "wait", None),
                )
                .await
        }));
    }
    wait_for_pending(&service, runtime_id, 8).await;

    service.terminate(runtime_id).await.unwrap();
    for handle in pending {
        let outcome = handle.await.unwrap();
        assert!(
            matches!(
                outcome,
                Err(ExecutionError::Terminated { runtime_id: id, .. }) if id == runtime_id
            ),
            "unexpected outcome: {outcome:?}"
        );
    }
    assert_eq!(service.runtime_count(), 0);
    assert!(!service.is_executing(&snap_id));
}

#[tokio::test]
async fn mixed_outcomes_each_resolve_once() {
    let executor = ScriptedExecutor::new()
        .on("fast", Behavior::Reply(json!(1)))
        .on("slow", Behavior::Delay(Duration::from_millis(30), json!(2)))
        .on("fail", Behavior::Fail(JsonRpcError::new("nope").with_code(-1)))
        .on("stuck", Behavior::Hang);
    let config = ExecutionConfig {
        handler_timeouts_ms: BTreeMap::from([("onRpcRequest".to_string(), 200)]),
        ..ExecutionConfig::default()
    };
    let (service, snap_id, runtime_id) = loaded(&executor, config).await;

    let call = |id: u64, method: &'static str| {
        let service = service.clone();
        let snap_id = snap_id.clone();
        tokio::spawn(async move {
            service
                .invoke(
                    &snap_id,
                    HandlerType::OnRpcRequest,
                    "https://dapp.example",
                    JsonRpcRequest::new(id, method, None),
                )
                .await
        })
    };
    let stuck = call(1, "stuck");
    let fast = call(2, "fast");
    let slow = call(3, "slow");
    let fail = call(4, "fail");

    assert_eq!(fast.await.unwrap().unwrap(), json!(1));
    assert_eq!(slow.await.unwrap().unwrap(), json!(2));
    assert!(matches!(fail.await.unwrap(), Err(ExecutionError::Snap(e)) if e.code == Some(-1)));
    assert!(stuck.await.unwrap().unwrap_err().is_timeout());

    // Nothing left dangling; a late answer has nowhere to go.
    assert_eq!(service.pending_requests(runtime_id), 0);
    assert_eq!(executor.calls().len(), 4);
}

#[tokio::test]
async fn stopping_a_busy_snap_is_not_a_crash() {
    let executor = ScriptedExecutor::new()
        .on("stall", Behavior::Hang)
        .on("hello", Behavior::Reply(json!("hi")));
    let host = SnapHost::new(executor, MockApprovalHandler::new());
    let id = host.publish("npm:busy", "1.0.0", |_| {});
    host.install(&id, "*").await.unwrap();

    let in_flight = {
        let host_controller = host.controller.clone();
        let id = id.clone();
        tokio::spawn(async move {
            host_controller
                .handle_request(snaps_controller::SnapRequest::new(
                    id,
                    common::DAPP,
                    HandlerType::OnRpcRequest,
                    JsonRpcRequest::new(1, "stall", None),
                ))
                .await
        })
    };
    for _ in 0..300 {
        if host.executor.call_count("stall") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    host.controller.stop_snap(&id).await.unwrap();
    let err = in_flight.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Terminated);
    assert_eq!(host.controller.get(&id).unwrap().status(), &SnapStatus::Stopped);

    // The next call brings it back up.
    assert_eq!(host.call(&id, "hello", None).await.unwrap(), json!("hi"));
    assert_eq!(host.executor.loads().len(), 2);
}
