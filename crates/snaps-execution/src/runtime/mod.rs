//! Runtime side of the command protocol.
//!
//! [`RuntimeLoop`] serves one host connection over any byte stream and hands
//! the actual work to a [`SnapExecutor`]. It runs inside the `snaps-worker`
//! process for process isolation and inside a spawned task for the in-process
//! backend.

mod executor;
#[cfg(feature = "wasm")]
pub mod wasm;

pub use executor::{ExecutorFactory, HostRpc, SnapExecutor};

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde_json::Value;
use snaps_core::{HandlerType, JsonRpcError, JsonRpcRequest, SnapId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::ExecutionResult;
use crate::protocol::{
    Command, CommandRequest, CommandResponse, Frame, accept_handshake, frame_reader,
    frame_writer, next_frame, send_frame,
};
use executor::RpcChannel;

/// Reply to `ping` and `terminate`.
pub const OK: &str = "OK";

/// Serves the command protocol for one runtime.
pub struct RuntimeLoop {
    executor: Arc<dyn SnapExecutor>,
}

impl std::fmt::Debug for RuntimeLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeLoop").finish_non_exhaustive()
    }
}

/// State shared by the loop and its spawned command tasks.
struct Shared {
    executor: Arc<dyn SnapExecutor>,
    outbound: mpsc::UnboundedSender<Frame>,
    rpc: Arc<RpcChannel>,
    loaded: Mutex<BTreeSet<SnapId>>,
}

impl Shared {
    fn reply(&self, response: &CommandResponse) {
        match Frame::command(response) {
            Ok(frame) => {
                if self.outbound.send(frame).is_err() {
                    debug!(id = response.id, "Host writer closed; reply dropped");
                }
            },
            Err(e) => warn!(id = response.id, error = %e, "Failed to encode reply"),
        }
    }

    fn is_loaded(&self, snap_id: &SnapId) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(snap_id)
    }
}

impl RuntimeLoop {
    /// Serve with `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn SnapExecutor>) -> Self {
        Self { executor }
    }

    /// Run until the host sends `terminate` or closes the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake or the stream fails.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> ExecutionResult<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = frame_reader(reader);
        let mut writer = frame_writer(writer);
        accept_handshake(&mut reader, &mut writer).await?;
        debug!("Runtime ready");

        let (outbound, mut queue) = mpsc::unbounded_channel::<Frame>();
        let (stop, mut stopped) = oneshot::channel::<()>();
        let writer_task = tokio::spawn(async move {
            let mut stopping = false;
            loop {
                let frame = if stopping {
                    queue.recv().await
                } else {
                    tokio::select! {
                        biased;
                        frame = queue.recv() => frame,
                        _ = &mut stopped => {
                            // Flush what is already queued, then exit.
                            stopping = true;
                            queue.close();
                            continue;
                        },
                    }
                };
                let Some(frame) = frame else { break };
                if let Err(e) = send_frame(&mut writer, &frame).await {
                    warn!(error = %e, "Runtime writer failed");
                    break;
                }
            }
        });

        let shared = Arc::new(Shared {
            executor: self.executor,
            rpc: RpcChannel::new(outbound.clone()),
            outbound,
            loaded: Mutex::new(BTreeSet::new()),
        });
        let mut tasks = JoinSet::new();

        let outcome = loop {
            while tasks.try_join_next().is_some() {}

            let frame = match next_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Host closed the stream");
                    break Ok(());
                },
                Err(e) => break Err(e),
            };

            match frame {
                Frame::Command(data) => {
                    let request: CommandRequest = match serde_json::from_value(data) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed command");
                            continue;
                        },
                    };
                    if request.command == Command::Terminate {
                        shared.executor.terminate().await;
                        shared.reply(&CommandResponse::ok(request.id, Value::from(OK)));
                        info!("Terminate received");
                        break Ok(());
                    }
                    handle_command(&shared, &mut tasks, request);
                },
                Frame::Rpc(data) => match serde_json::from_value::<CommandResponse>(data) {
                    Ok(response) => shared.rpc.resolve(response),
                    Err(e) => warn!(error = %e, "Dropping malformed RPC response"),
                },
                Frame::Syn | Frame::Ack => debug!("Ignoring handshake frame after setup"),
            }
        };

        tasks.abort_all();
        shared.rpc.close();
        drop(shared);
        let _ = stop.send(());
        let _ = writer_task.await;
        outcome
    }
}

fn handle_command(shared: &Arc<Shared>, tasks: &mut JoinSet<()>, request: CommandRequest) {
    let id = request.id;
    debug!(id, command = request.command.as_str(), "Command received");
    match request.command {
        Command::Ping => shared.reply(&CommandResponse::ok(id, Value::from(OK))),
        Command::ExecuteSnap => match parse_execute(&request.params) {
            Ok((snap_id, source, endowments)) => {
                let newly_loaded = shared
                    .loaded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(snap_id.clone());
                if !newly_loaded {
                    shared.reply(&CommandResponse::err(
                        id,
                        JsonRpcError::new(format!("snap {snap_id} is already executing"))
                            .with_code(JsonRpcError::INTERNAL),
                    ));
                    return;
                }
                let shared = Arc::clone(shared);
                tasks.spawn(async move {
                    let host = HostRpc::new(snap_id.clone(), Arc::clone(&shared.rpc));
                    let outcome = shared
                        .executor
                        .execute(&snap_id, source, endowments, host)
                        .await;
                    let response = match outcome {
                        Ok(()) => CommandResponse::ok(id, Value::from(OK)),
                        Err(e) => {
                            shared
                                .loaded
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&snap_id);
                            CommandResponse::err(id, e)
                        },
                    };
                    shared.reply(&response);
                });
            },
            Err(e) => shared.reply(&CommandResponse::err(id, e)),
        },
        Command::SnapRpc => match parse_invoke(&request.params) {
            Ok((snap_id, handler, origin, rpc)) => {
                if !shared.is_loaded(&snap_id) {
                    shared.reply(&CommandResponse::err(
                        id,
                        JsonRpcError::new(format!("snap {snap_id} is not executing"))
                            .with_code(JsonRpcError::INTERNAL),
                    ));
                    return;
                }
                let shared = Arc::clone(shared);
                tasks.spawn(async move {
                    let outcome = shared.executor.invoke(&snap_id, handler, origin, rpc).await;
                    let response = match outcome {
                        Ok(result) => CommandResponse::ok(id, result),
                        Err(e) => CommandResponse::err(id, e),
                    };
                    shared.reply(&response);
                });
            },
            Err(e) => shared.reply(&CommandResponse::err(id, e)),
        },
        Command::Terminate => {},
        Command::Unknown => shared.reply(&CommandResponse::err(
            id,
            JsonRpcError::new("unknown command").with_code(JsonRpcError::METHOD_NOT_FOUND),
        )),
    }
}

fn param<T: DeserializeOwned>(
    params: &[Value],
    index: usize,
    name: &str,
) -> Result<T, JsonRpcError> {
    let value = params.get(index).cloned().ok_or_else(|| {
        JsonRpcError::new(format!("missing parameter '{name}'"))
            .with_code(JsonRpcError::INVALID_PARAMS)
    })?;
    serde_json::from_value(value).map_err(|e| {
        JsonRpcError::new(format!("invalid parameter '{name}': {e}"))
            .with_code(JsonRpcError::INVALID_PARAMS)
    })
}

fn parse_execute(params: &[Value]) -> Result<(SnapId, Vec<u8>, Vec<String>), JsonRpcError> {
    let snap_id: SnapId = param(params, 0, "snapId")?;
    let encoded: String = param(params, 1, "sourceCode")?;
    let source = STANDARD.decode(encoded).map_err(|e| {
        JsonRpcError::new(format!("sourceCode is not base64: {e}"))
            .with_code(JsonRpcError::INVALID_PARAMS)
    })?;
    let endowments: Vec<String> = param(params, 2, "endowments")?;
    Ok((snap_id, source, endowments))
}

fn parse_invoke(
    params: &[Value],
) -> Result<(SnapId, HandlerType, String, JsonRpcRequest), JsonRpcError> {
    Ok((
        param(params, 0, "snapId")?,
        param(params, 1, "handler")?,
        param(params, 2, "origin")?,
        param(params, 3, "request")?,
    ))
}
