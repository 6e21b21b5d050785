//! Snaps Execution - isolated runtimes and the command protocol that drives
//! them.
//!
//! The host side is [`ExecutionService`]: it creates runtimes through an
//! [`IsolationBackend`](backend::IsolationBackend), loads snaps into them and
//! multiplexes handler invocations over one newline-delimited JSON stream per
//! runtime. Every request resolves exactly once, with the snap's result, the
//! snap's own error, a timeout, or termination.
//!
//! The runtime side is [`RuntimeLoop`](runtime::RuntimeLoop), which serves
//! the protocol and hands snap code to a [`SnapExecutor`](runtime::SnapExecutor).
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use snaps_config::ExecutionConfig;
//! use snaps_execution::ExecutionService;
//! use snaps_execution::backend::ProcessBackend;
//!
//! # async fn demo() -> snaps_execution::ExecutionResult<()> {
//! let backend = Arc::new(ProcessBackend::from_path()?);
//! let service = ExecutionService::new(backend, ExecutionConfig::default());
//! let runtime_id = service.start().await?;
//! service.ping(runtime_id).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod backend;
pub mod prelude;
pub mod protocol;
pub mod runtime;

mod connection;
mod error;
mod events;
mod rpc;
mod runtime_id;
mod service;

pub use error::{ExecutionError, ExecutionResult};
pub use events::ExecutionEvent;
pub use rpc::{RejectAllRpc, RpcHandler};
pub use runtime_id::RuntimeId;
pub use service::{ExecutionService, RequestTimers};
