//! Runtimes as `snaps-worker` child processes.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{IsolationBackend, RuntimeGuard, RuntimeStreams};
use crate::error::{ExecutionError, ExecutionResult};
use crate::runtime_id::RuntimeId;

/// Worker executable looked up on `PATH` by default.
pub const WORKER_BINARY: &str = "snaps-worker";

/// Spawns one worker process per runtime, talking over its stdin/stdout.
///
/// The child gets a cleared environment apart from `RUST_LOG`, and its
/// stderr is inherited for logs.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessBackend {
    /// Use the worker at `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Find `snaps-worker` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::EnvironmentUnavailable`] if it is not there.
    pub fn from_path() -> ExecutionResult<Self> {
        let program = which::which(WORKER_BINARY).map_err(|e| {
            ExecutionError::EnvironmentUnavailable(format!("cannot find {WORKER_BINARY}: {e}"))
        })?;
        Ok(Self::new(program))
    }

    /// Extra arguments for every worker.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The worker executable.
    #[must_use]
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn command(&self, runtime_id: &RuntimeId) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--runtime-id")
            .arg(runtime_id.to_string())
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Ok(filter) = std::env::var("RUST_LOG") {
            cmd.env("RUST_LOG", filter);
        }
        cmd
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, runtime_id: &RuntimeId) -> ExecutionResult<RuntimeStreams> {
        let mut child = self.command(runtime_id).spawn().map_err(|e| {
            ExecutionError::EnvironmentUnavailable(format!(
                "failed to spawn {}: {e}",
                self.program.display()
            ))
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ExecutionError::EnvironmentUnavailable(
                "worker stdio was not captured".into(),
            ));
        };
        info!(%runtime_id, pid = ?child.id(), "Worker spawned");
        debug!(program = %self.program.display(), "Worker command");

        Ok(RuntimeStreams {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            guard: RuntimeGuard::process(child),
        })
    }
}
