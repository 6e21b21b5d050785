//! Spawns the real worker binary through `ProcessBackend`.

use std::sync::Arc;

use snaps_config::ExecutionConfig;
use snaps_execution::backend::ProcessBackend;
use snaps_execution::{ExecutionError, ExecutionService};

fn service() -> ExecutionService {
    let backend = ProcessBackend::new(env!("CARGO_BIN_EXE_snaps-worker"))
        .with_args(["--log-level", "warn"]);
    ExecutionService::new(Arc::new(backend), ExecutionConfig::default())
}

/// Test handshake and one ping against a spawned worker, then teardown.
#[tokio::test]
async fn test_worker_handshake_and_ping() {
    let service = service();

    let runtime_id = service.start().await.unwrap();
    assert_eq!(service.runtime_count(), 1);

    service.ping(runtime_id).await.unwrap();
    assert_eq!(service.pending_requests(runtime_id), 0);

    service.terminate(runtime_id).await.unwrap();
    assert_eq!(service.runtime_count(), 0);
}

/// Test that a terminated worker no longer answers.
#[tokio::test]
async fn test_ping_after_terminate_fails() {
    let service = service();
    let runtime_id = service.start().await.unwrap();
    service.terminate(runtime_id).await.unwrap();

    let err = service.ping(runtime_id).await.unwrap_err();
    assert!(matches!(err, ExecutionError::UnknownRuntime(id) if id == runtime_id));
}
