//! Runtimes as tasks in the host process.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{IsolationBackend, RuntimeGuard, RuntimeStreams};
use crate::error::ExecutionResult;
use crate::runtime::{ExecutorFactory, RuntimeLoop};
use crate::runtime_id::RuntimeId;

/// Pipe buffer per direction.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Runs each runtime loop as a tokio task over an in-memory pipe.
///
/// Every runtime gets a fresh executor from the factory, so snaps in
/// different runtimes share no executor state.
pub struct InProcessBackend {
    factory: Arc<dyn ExecutorFactory>,
}

impl std::fmt::Debug for InProcessBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessBackend").finish_non_exhaustive()
    }
}

impl InProcessBackend {
    /// Use `factory` for each new runtime.
    #[must_use]
    pub fn new(factory: impl ExecutorFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }
}

#[async_trait]
impl IsolationBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn spawn(&self, runtime_id: &RuntimeId) -> ExecutionResult<RuntimeStreams> {
        let (host_side, runtime_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (runtime_reader, runtime_writer) = tokio::io::split(runtime_side);
        let (reader, writer) = tokio::io::split(host_side);

        let runtime = RuntimeLoop::new(self.factory.create());
        let runtime_id = *runtime_id;
        let task = tokio::spawn(async move {
            match runtime.serve(runtime_reader, runtime_writer).await {
                Ok(()) => debug!(%runtime_id, "Runtime loop finished"),
                Err(e) => warn!(%runtime_id, error = %e, "Runtime loop failed"),
            }
        });

        Ok(RuntimeStreams {
            reader: Box::new(reader),
            writer: Box::new(writer),
            guard: RuntimeGuard::task(task),
        })
    }
}
