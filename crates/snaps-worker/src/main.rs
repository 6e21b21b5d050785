//! `snaps-worker` - one isolated runtime per process.
//!
//! Speaks the command protocol on stdin/stdout and runs WebAssembly snaps.
//! Logs go to stderr; stdout belongs to the protocol. The host spawns this
//! binary through `ProcessBackend` and kills it on teardown.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use snaps_execution::runtime::RuntimeLoop;
use snaps_execution::runtime::wasm::WasmExecutor;
use snaps_telemetry::{LogConfig, LogFormat, LogTarget};
use tracing::info;

/// Snaps worker - isolated snap runtime.
#[derive(Parser)]
#[command(name = "snaps-worker")]
#[command(author, version, about = "Isolated snap runtime speaking the command protocol on stdio")]
struct Args {
    /// Identity assigned by the host, used only in logs.
    #[arg(long)]
    runtime_id: Option<String>,

    /// Base log level.
    #[arg(long, env = "SNAPS_WORKER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Linear memory cap per snap, in megabytes.
    #[arg(long, default_value_t = 64)]
    memory_mb: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = LogConfig::new(&args.log_level)
        .with_format(LogFormat::Compact)
        .with_target(LogTarget::Stderr)
        .without_ansi();
    if let Err(e) = snaps_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let runtime_id = args.runtime_id.unwrap_or_else(|| "unassigned".to_string());
    info!(%runtime_id, pid = std::process::id(), "Worker starting");

    let executor =
        WasmExecutor::new().with_memory_limit(args.memory_mb.saturating_mul(1024 * 1024));
    RuntimeLoop::new(Arc::new(executor))
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("runtime loop failed")?;

    info!(%runtime_id, "Worker exiting");
    Ok(())
}
