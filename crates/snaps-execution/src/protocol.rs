//! Wire protocol between the host and an isolated runtime.
//!
//! Frames are newline-delimited JSON over one duplex byte stream. Two logical
//! sub-channels share the stream, distinguished by the envelope name:
//!
//! | name      | direction       | payload                                   |
//! |-----------|-----------------|-------------------------------------------|
//! | `syn`     | host → runtime  | none; opens the multiplex                 |
//! | `ack`     | runtime → host  | none; the runtime is ready                |
//! | `command` | both            | [`CommandRequest`], [`CommandResponse`], [`Notification`] |
//! | `rpc`     | both            | [`RpcRequest`] from the runtime, [`CommandResponse`] back |
//!
//! Command ids are assigned by the host and RPC ids by the runtime. The two
//! spaces never mix: a reply on one sub-channel cannot resolve a request
//! pending on the other.

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use snaps_core::{JsonRpcError, SnapId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use crate::error::{ExecutionError, ExecutionResult};

/// Longest accepted frame. Bundles travel inside `executeSnap`.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Line-framed reader half.
pub type FrameReader<R> = FramedRead<R, LinesCodec>;
/// Line-framed writer half.
pub type FrameWriter<W> = FramedWrite<W, LinesCodec>;

/// Wrap a reader in the line codec.
pub fn frame_reader<R: AsyncRead>(reader: R) -> FrameReader<R> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
}

/// Wrap a writer in the line codec.
pub fn frame_writer<W: AsyncWrite>(writer: W) -> FrameWriter<W> {
    FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
}

/// Multiplex envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "lowercase")]
pub enum Frame {
    /// Handshake open.
    Syn,
    /// Handshake acknowledgment.
    Ack,
    /// Command sub-channel message.
    Command(Value),
    /// RPC sub-channel message.
    Rpc(Value),
}

impl Frame {
    /// Serialize to one line.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Protocol`] if the payload cannot be encoded.
    pub fn encode(&self) -> ExecutionResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one line.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Protocol`] for anything that is not an
    /// envelope.
    pub fn decode(line: &str) -> ExecutionResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Wrap a serializable command-channel message.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Protocol`] if `message` cannot be encoded.
    pub fn command<T: Serialize>(message: &T) -> ExecutionResult<Self> {
        Ok(Self::Command(serde_json::to_value(message)?))
    }

    /// Wrap a serializable RPC-channel message.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Protocol`] if `message` cannot be encoded.
    pub fn rpc<T: Serialize>(message: &T) -> ExecutionResult<Self> {
        Ok(Self::Rpc(serde_json::to_value(message)?))
    }
}

/// Commands the host sends to a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    /// Liveness check. Answered with `"OK"`.
    Ping,
    /// Shut the runtime down. Answered with `"OK"` before exiting.
    Terminate,
    /// Load a snap: `[snapId, sourceBase64, endowments]`.
    ExecuteSnap,
    /// Invoke a handler: `[snapId, handler, origin, request]`.
    SnapRpc,
    /// Anything this runtime does not understand.
    #[serde(other)]
    Unknown,
}

impl Command {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Terminate => "terminate",
            Self::ExecuteSnap => "executeSnap",
            Self::SnapRpc => "snapRpc",
            Self::Unknown => "unknown",
        }
    }
}

/// A host-to-runtime command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Host-assigned id; echoed by the response.
    pub id: u64,
    /// What to do.
    pub command: Command,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Keep a present `null` distinct from an absent field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// A reply to a [`CommandRequest`] or an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Id of the request being answered.
    pub id: u64,
    /// Success payload. `null` is a valid result.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl CommandResponse {
    /// A success reply.
    #[must_use]
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failure reply.
    #[must_use]
    pub fn err(id: u64, error: JsonRpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the carried error, or [`ExecutionError::Protocol`] if the
    /// reply carries neither a result nor an error, or both.
    pub fn into_result(self) -> ExecutionResult<Result<Value, JsonRpcError>> {
        match (self.result, self.error) {
            (Some(result), None) => Ok(Ok(result)),
            (None, Some(error)) => Ok(Err(error)),
            (None, None) => Err(ExecutionError::Protocol(format!(
                "response {} has neither result nor error",
                self.id
            ))),
            (Some(_), Some(_)) => Err(ExecutionError::Protocol(format!(
                "response {} has both result and error",
                self.id
            ))),
        }
    }
}

/// Runtime-to-host notification names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationMethod {
    /// Snap code failed outside any request.
    UnhandledError,
    /// A snap started network activity.
    OutboundRequest,
    /// A snap's network activity finished.
    OutboundResponse,
}

/// An id-less message from the runtime on the command sub-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// What happened.
    pub method: NotificationMethod,
    /// Details, typically `{ snapId, error? }`.
    #[serde(default)]
    pub params: Value,
}

/// Anything a runtime may put on the command sub-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuntimeMessage {
    /// A reply to a host command.
    Response(CommandResponse),
    /// An unsolicited event.
    Notification(Notification),
}

/// A call from snap code back out to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    /// Runtime-assigned id.
    pub id: u64,
    /// The calling snap.
    pub snap_id: SnapId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

/// Host side of the handshake: send `syn`, wait for `ack`.
///
/// Frames that arrive before the `ack` are logged and dropped.
///
/// # Errors
///
/// Returns [`ExecutionError::Io`] if the stream fails or closes first.
pub async fn initiate_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> ExecutionResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_frame(writer, &Frame::Syn).await?;
    loop {
        match next_frame(reader).await? {
            Some(Frame::Ack) => {
                debug!("Handshake acknowledged");
                return Ok(());
            },
            Some(other) => warn!(frame = ?other, "Dropping frame received before ack"),
            None => return Err(ExecutionError::Io("stream closed during handshake".into())),
        }
    }
}

/// Runtime side of the handshake: wait for `syn`, send `ack`.
///
/// # Errors
///
/// Returns [`ExecutionError::Io`] if the stream fails or closes first.
pub async fn accept_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> ExecutionResult<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        match next_frame(reader).await? {
            Some(Frame::Syn) => break,
            Some(other) => warn!(frame = ?other, "Dropping frame received before syn"),
            None => return Err(ExecutionError::Io("stream closed during handshake".into())),
        }
    }
    send_frame(writer, &Frame::Ack).await
}

/// Write one frame.
///
/// # Errors
///
/// Returns an error if encoding or the write fails.
pub async fn send_frame<W: AsyncWrite + Unpin>(
    writer: &mut FrameWriter<W>,
    frame: &Frame,
) -> ExecutionResult<()> {
    let line = frame.encode()?;
    writer
        .send(line)
        .await
        .map_err(|e| ExecutionError::Io(e.to_string()))
}

/// Read the next well-formed frame, skipping undecodable lines.
///
/// Returns `Ok(None)` at end of stream.
///
/// # Errors
///
/// Returns [`ExecutionError::Io`] if the underlying stream fails.
pub async fn next_frame<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> ExecutionResult<Option<Frame>> {
    while let Some(line) = reader.next().await {
        let line = line.map_err(|e| ExecutionError::Io(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        match Frame::decode(&line) {
            Ok(frame) => return Ok(Some(frame)),
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }
    Ok(None)
}
