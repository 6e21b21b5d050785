//! Isolation backends: how a fresh runtime and its byte stream come to exist.

mod in_process;
mod process;

pub use in_process::InProcessBackend;
pub use process::ProcessBackend;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ExecutionResult;
use crate::runtime_id::RuntimeId;

/// Boxed read half of a runtime stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a runtime stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug)]
enum GuardKind {
    Task(JoinHandle<()>),
    Process(Child),
}

/// Whatever keeps a runtime alive. Dropping it without
/// [`shutdown`](Self::shutdown) still tears the runtime down.
#[derive(Debug)]
pub struct RuntimeGuard {
    kind: Option<GuardKind>,
}

impl RuntimeGuard {
    /// A runtime loop running as a task in this process.
    #[must_use]
    pub fn task(handle: JoinHandle<()>) -> Self {
        Self {
            kind: Some(GuardKind::Task(handle)),
        }
    }

    /// A worker child process. Spawn it with `kill_on_drop`.
    #[must_use]
    pub fn process(child: Child) -> Self {
        Self {
            kind: Some(GuardKind::Process(child)),
        }
    }

    /// Tear the runtime down and wait for it to go away.
    pub async fn shutdown(mut self) {
        match self.kind.take() {
            Some(GuardKind::Task(handle)) => {
                handle.abort();
                let _ = handle.await;
            },
            Some(GuardKind::Process(mut child)) => {
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "Worker already exited");
                }
                match child.wait().await {
                    Ok(status) => debug!(%status, "Worker exited"),
                    Err(e) => warn!(error = %e, "Failed to reap worker"),
                }
            },
            None => {},
        }
    }
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        if let Some(GuardKind::Task(handle)) = &self.kind {
            handle.abort();
        }
    }
}

/// A freshly spawned runtime.
pub struct RuntimeStreams {
    /// Bytes from the runtime.
    pub reader: BoxedReader,
    /// Bytes to the runtime.
    pub writer: BoxedWriter,
    /// Keeps the runtime alive.
    pub guard: RuntimeGuard,
}

impl std::fmt::Debug for RuntimeStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeStreams")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Creates isolated runtimes.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Create a new runtime and return its stream.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::EnvironmentUnavailable`](crate::ExecutionError::EnvironmentUnavailable)
    /// if the isolation primitive cannot be created.
    async fn spawn(&self, runtime_id: &RuntimeId) -> ExecutionResult<RuntimeStreams>;
}
